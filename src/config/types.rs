use serde::Deserialize;
use std::collections::HashMap;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "_";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;
pub const DEFAULT_ROUTE_PATH: &str = "/";
pub const DEFAULT_ROOT: &str = "./www";
pub const DEFAULT_CGI_LIMIT: usize = 32;

fn default_ports() -> Vec<u16> {
    vec![DEFAULT_PORT]
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_route_path() -> String {
    DEFAULT_ROUTE_PATH.to_string()
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string(), "index.htm".to_string()]
}

fn default_cgi_limit() -> usize {
    DEFAULT_CGI_LIMIT
}

fn default_auth_filename() -> String {
    ".htpasswd".to_string()
}

/// `<glob-pattern>  [<min>-]<max>` — one configured bandwidth envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleRule {
    pub pattern: String,
    pub max_limit: u64,
    #[serde(default)]
    pub min_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_route_path")]
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub redirection: Option<String>,
    #[serde(default)]
    pub redirect_code: Option<u16>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default)]
    pub default_file: Option<String>,
    #[serde(default)]
    pub cgi_ext: Option<String>,
    #[serde(default)]
    pub cgi_path: Option<String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub upload_dir: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: default_route_path(),
            methods: default_methods(),
            redirection: None,
            redirect_code: None,
            root: default_root(),
            default_file: None,
            cgi_ext: None,
            cgi_path: None,
            autoindex: false,
            upload_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub default_server: bool,
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
    #[serde(default = "default_max_body_size")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,

    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub p3p: Option<String>,
    #[serde(default)]
    pub max_age: Option<u64>,

    #[serde(default)]
    pub cgi_pattern: Option<String>,
    #[serde(default = "default_cgi_limit")]
    pub cgi_limit: usize,

    #[serde(default)]
    pub referrer_url_pattern: Option<String>,
    #[serde(default)]
    pub local_host_pattern: Option<String>,
    #[serde(default)]
    pub no_empty_referrers: bool,

    #[serde(default)]
    pub vhost: bool,
    #[serde(default = "default_true")]
    pub symlink_check: bool,
    #[serde(default)]
    pub global_passwd: bool,
    #[serde(default = "default_auth_filename")]
    pub auth_filename: String,

    #[serde(default)]
    pub tilde_prefix: Option<String>,
    #[serde(default)]
    pub tilde_user_postfix: Option<String>,

    #[serde(default)]
    pub error_dir: Option<String>,

    #[serde(default)]
    pub throttles: Vec<ThrottleRule>,
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: default_ports(),
            server_name: default_server_name(),
            default_server: false,
            error_pages: HashMap::new(),
            client_max_body_size: default_max_body_size(),
            routes: Vec::new(),
            index_files: default_index_files(),
            charset: None,
            p3p: None,
            max_age: None,
            cgi_pattern: None,
            cgi_limit: default_cgi_limit(),
            referrer_url_pattern: None,
            local_host_pattern: None,
            no_empty_referrers: false,
            vhost: false,
            symlink_check: true,
            global_passwd: false,
            auth_filename: default_auth_filename(),
            tilde_prefix: None,
            tilde_user_postfix: None,
            error_dir: None,
            throttles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}
