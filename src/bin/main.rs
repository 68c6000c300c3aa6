use std::path::PathBuf;

use clap::Parser;

use thttpd_core::config::{display_config, load_config, ServerConfig};
use thttpd_core::error::Result;
use thttpd_core::{log, CoreContext};

/// Single-process, non-blocking HTTP/1.0-1.1 server.
#[derive(Parser, Debug)]
#[command(name = "thttpd_core", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'C', long = "config")]
    config: PathBuf,

    /// Enable debug-level logging regardless of RUST_LOG.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Override every configured server's listening port.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Change root into the document root before serving (requires root).
    #[arg(long = "chroot")]
    chroot: bool,

    /// Drop privileges to this user after binding.
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    #[arg(long = "charset")]
    charset: Option<String>,

    #[arg(long = "p3p")]
    p3p: Option<String>,

    #[arg(long = "max-age")]
    max_age: Option<u64>,

    #[arg(long = "cgi-pat")]
    cgi_pattern: Option<String>,

    #[arg(long = "cgi-limit")]
    cgi_limit: Option<usize>,

    #[arg(long = "no-symlink-check")]
    no_symlink_check: bool,

    #[arg(long = "vhost")]
    vhost: bool,

    #[arg(long = "global-passwd")]
    global_passwd: bool,
}

fn apply_overrides(cli: &Cli, mut servers: Vec<ServerConfig>) -> Vec<ServerConfig> {
    for server in &mut servers {
        if let Some(port) = cli.port {
            server.ports = vec![port];
        }
        if let Some(charset) = &cli.charset {
            server.charset = Some(charset.clone());
        }
        if let Some(p3p) = &cli.p3p {
            server.p3p = Some(p3p.clone());
        }
        if let Some(max_age) = cli.max_age {
            server.max_age = Some(max_age);
        }
        if let Some(pat) = &cli.cgi_pattern {
            server.cgi_pattern = Some(pat.clone());
        }
        if let Some(limit) = cli.cgi_limit {
            server.cgi_limit = limit;
        }
        if cli.no_symlink_check {
            server.symlink_check = false;
        }
        if cli.vhost {
            server.vhost = true;
        }
        if cli.global_passwd {
            server.global_passwd = true;
        }
    }
    servers
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    log::init_logging();
    if cli.debug {
        tracing::debug!("debug logging requested via -d");
    }

    if cli.chroot {
        #[cfg(unix)]
        {
            let root = std::ffi::CString::new("/").unwrap();
            if unsafe { libc::chroot(root.as_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
    }

    if let Some(user) = &cli.user {
        drop_privileges(user)?;
    }

    let config = load_config(&cli.config)?;
    let servers = apply_overrides(&cli, config.servers);
    display_config(&servers);

    log::startup_banner(env!("CARGO_PKG_VERSION"), servers.iter().map(|s| s.ports.len()).sum());

    let mut ctx = CoreContext::bind(servers)?;
    ctx.run()
}

#[cfg(unix)]
fn drop_privileges(user: &str) -> Result<()> {
    use std::ffi::CString;
    let cuser = CString::new(user).map_err(|_| "invalid user name".to_string())?;
    unsafe {
        let pw = libc::getpwnam(cuser.as_ptr());
        if pw.is_null() {
            return Err(format!("unknown user: {user}").into());
        }
        if libc::setgid((*pw).pw_gid) != 0 || libc::setuid((*pw).pw_uid) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_user: &str) -> Result<()> {
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
