use std::fmt;

use super::types::{RouteConfig, ServerConfig};

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  ───────────────────────────────────────────────")?;
        writeln!(f, "  ⦿ Network:     {} via ports {:?}", self.host, self.ports)?;
        writeln!(f, "  ⦿ Identity:    {}", self.server_name)?;
        writeln!(
            f,
            "  ⦿ Default:     {}",
            if self.default_server { "YES" } else { "NO" }
        )?;
        writeln!(
            f,
            "  ⦿ Body Limit:  {} KB",
            self.client_max_body_size / 1024
        )?;
        if self.vhost {
            writeln!(f, "  ⦿ Virtual hosting enabled")?;
        }

        if !self.error_pages.is_empty() {
            writeln!(f, "  ⦿ Error Pages:")?;
            let mut codes: Vec<_> = self.error_pages.iter().collect();
            codes.sort_by_key(|(code, _)| **code);
            for (code, path) in codes {
                writeln!(f, "    {:4} → {}", code, path)?;
            }
        }

        writeln!(f, "\n  ROUTING TABLE ({})", self.routes.len())?;
        writeln!(f, "  ───────────────────────────────────────────────")?;
        let mut sorted_routes = self.routes.clone();
        sorted_routes.sort_by(|a, b| a.path.cmp(&b.path));
        for (idx, route) in sorted_routes.iter().enumerate() {
            let is_last = idx == sorted_routes.len() - 1;
            let branch = if is_last { "  └──" } else { "  ├──" };
            writeln!(f, "  {} {}", branch, route.path)?;
            route.fmt_details(f, is_last)?;
        }
        Ok(())
    }
}

impl RouteConfig {
    pub(crate) fn fmt_details(&self, f: &mut fmt::Formatter<'_>, is_last_route: bool) -> fmt::Result {
        let indent = if is_last_route { "     " } else { "  │  " };
        writeln!(f, "  {}├─ Methods: {}", indent, self.methods.join(" | "))?;
        writeln!(f, "  {}├─ Root:    {}", indent, self.root)?;
        if let Some(redirect) = &self.redirection {
            writeln!(f, "  {}├─ Redirect → {}", indent, redirect)?;
        }
        if let Some(ext) = &self.cgi_ext {
            writeln!(f, "  {}├─ CGI ext: {}", indent, ext)?;
        }
        if self.autoindex {
            writeln!(f, "  {}└─ Autoindex enabled", indent)?;
        }
        Ok(())
    }
}

pub fn display_config(servers: &[ServerConfig]) {
    for server in servers {
        println!("{}", server);
    }
}
