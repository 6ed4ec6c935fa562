#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use log::{info, error, LevelFilter};
use serde::Deserialize;
use std::{env, fmt, fs, path::Path, str::FromStr};
use lazy_static::lazy_static;
use structopt::StructOpt;

use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

// Hello Utilities
use crate::utils::{hello_utils::get_absolute_path, errors::Errors};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Directory and file locations. Unless otherwise noted, all files and directories
// are relative to the root directory.
const ENV_HELLO_ROOT_DIR   : &str = "HELLO_ROOT_DIR";
const DEFAULT_ROOT_DIR     : &str = "~/.hello_server";
const CONFIG_DIR           : &str = "/config";
const LOG4RS_CONFIG_FILE   : &str = "/log4rs.yml";  // relative to config dir
const HELLO_CONFIG_FILE    : &str = "/hello.toml";  // relative to config dir

// Networking.
const DEFAULT_HTTP_ADDR    : &str = "http://localhost";
const BASIC_HTTP_PORT      : u16  = 5000;
const EXTENDED_HTTP_PORT   : u16  = 5001;

// Relay defaults.
const DEFAULT_RELAY_URL    : &str = "http://localhost:5001";
const DEFAULT_RELAY_TIMEOUT_SECS : u64 = 10;

// Console logging used when no log4rs file is installed.
const DEFAULT_LOG_PATTERN  : &str = "{d(%Y-%m-%dT%H:%M:%S%.6f)} {h({l})} {t} - {m}{n}";

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Assign the command line arguments BEFORE RUNTIME_CTX is initialized in main.
lazy_static! {
    pub static ref HELLO_ARGS: HelloArgs = init_hello_args();
}

// Calculate the data directories BEFORE RUNTIME_CTX is initialized in main.
lazy_static! {
    pub static ref HELLO_DIRS: HelloDirs = init_hello_dirs();
}

// ***************************************************************************
//                                 Variant
// ***************************************************************************
/// The service flavor selected at startup.  The basic variant only serves
/// the greeting; the extended variant adds the data and relay endpoints and
/// permissive CORS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Basic,
    Extended,
}

impl Variant {
    pub fn default_port(&self) -> u16 {
        match self {
            Variant::Basic => BASIC_HTTP_PORT,
            Variant::Extended => EXTENDED_HTTP_PORT,
        }
    }
}

impl FromStr for Variant {
    type Err = Errors;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Variant::Basic),
            "extended" => Ok(Variant::Extended),
            _ => Err(Errors::InvalidVariant(s.to_string())),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Basic => write!(f, "basic"),
            Variant::Extended => write!(f, "extended"),
        }
    }
}

// ***************************************************************************
//                             Directory Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// HelloDirs:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct HelloDirs {
    pub root_dir: String,
    pub config_dir: String,
}

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// HelloArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, StructOpt)]
#[structopt(name = "hello_args", about = "Command line arguments for Hello Server.")]
pub struct HelloArgs {
    /// Specify the server's root data directory.
    ///
    /// The configuration files are read from its config subdirectory.
    /// The HELLO_ROOT_DIR environment variable takes precedence over this
    /// argument; ~/.hello_server is used when neither is set.
    #[structopt(short, long)]
    pub root_dir: Option<String>,

    /// Select the service variant: basic or extended.
    ///
    /// Overrides the variant named in the configuration file.
    #[structopt(short, long)]
    pub variant: Option<Variant>,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct RuntimeCtx {
    pub parms: Parms,
    pub variant: Variant,
    pub hello_args: &'static HelloArgs,
    pub hello_dirs: &'static HelloDirs,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: Option<u16>,
    pub variant: Option<Variant>,
    pub relay_url: String,
    pub relay_timeout_secs: u64,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// The configured port wins over the variant's well-known port.
    pub fn http_port(&self, variant: Variant) -> u16 {
        self.http_port.unwrap_or_else(|| variant.default_port())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "Hello Server".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: None,
            variant: None,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            relay_timeout_secs: DEFAULT_RELAY_TIMEOUT_SECS,
        }
    }
}

// ***************************************************************************
//                            Directory Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_hello_args:
// ---------------------------------------------------------------------------
/** Get the command line arguments. */
fn init_hello_args() -> HelloArgs {
    let args = HelloArgs::from_args();
    println!("{:?}", args);
    args
}

// ---------------------------------------------------------------------------
// init_hello_dirs:
// ---------------------------------------------------------------------------
/** Calculate the external data directories.  Nothing is created; a missing
 * directory simply means the built-in defaults are used.
 */
fn init_hello_dirs() -> HelloDirs {
    let root_dir = get_root_dir();
    let config_dir = root_dir.clone() + CONFIG_DIR;
    HelloDirs { root_dir, config_dir }
}

// ---------------------------------------------------------------------------
// get_root_dir:
// ---------------------------------------------------------------------------
fn get_root_dir() -> String {
    // Order of precedence:
    //  1. Environment variable
    //  2. Command line --root-dir argument
    //  3. Default location
    //
    let root_dir = env::var(ENV_HELLO_ROOT_DIR).unwrap_or_else(
        |_| {
            match HELLO_ARGS.root_dir.clone() {
                Some(r) => r,
                None => DEFAULT_ROOT_DIR.to_string(),
            }
        });

    // Canonicalize the path.
    get_absolute_path(&root_dir)
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the installed configuration file if there is one,
 * otherwise log to the console at info level.
 */
pub fn init_log() {
    let logconfig = init_log_config();
    if Path::new(&logconfig).is_file() {
        match log4rs::init_file(logconfig.clone(), Default::default()) {
            Ok(_) => (),
            Err(e) => {
                println!("{}", e);
                let s = format!("{}", Errors::Log4rsInitialization(logconfig));
                panic!("{}", s);
            },
        }
        info!("Log4rs initialized using: {}", logconfig);
    } else {
        if let Err(e) = init_console_log() {
            panic!("{}", Errors::Log4rsInitialization(e.to_string()));
        }
        info!("Log4rs initialized using the default console configuration.");
    }
}

// ---------------------------------------------------------------------------
// init_console_log:
// ---------------------------------------------------------------------------
fn init_console_log() -> Result<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(DEFAULT_LOG_PATTERN)))
        .build();
    let config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// init_log_config:
// ---------------------------------------------------------------------------
fn init_log_config() -> String {
    HELLO_DIRS.config_dir.clone() + LOG4RS_CONFIG_FILE
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file in the
 * config directory.  If the file cannot be read the default values are used.
 */
fn get_parms() -> Result<Parms> {
    // Get the config file path from its data directory.
    let config_file = HELLO_DIRS.config_dir.clone() + HELLO_CONFIG_FILE;

    // Read the configuration file.
    let config_file_abs = get_absolute_path(&config_file);
    info!("{}", Errors::ReadingConfigFile(config_file_abs.clone()));
    let contents = match fs::read_to_string(&config_file_abs) {
        Ok(c) => c,
        Err(_) => {
            info!("Unable to read configuration at {}. Using default values.", config_file_abs);
            return Ok(Parms { config_file: Default::default(), config: Config::new() });
        }
    };

    let config = parse_config(&contents, &config_file_abs)?;
    Ok(Parms { config_file: config_file_abs, config })
}

// ---------------------------------------------------------------------------
// parse_config:
// ---------------------------------------------------------------------------
/** Parse the toml configuration.  Keys left out of the file keep their
 * default values.
 */
pub fn parse_config(contents: &str, config_file: &str) -> Result<Config> {
    match toml::from_str(contents) {
        Ok(c)  => Ok(c),
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file.to_string()), e);
            error!("{}", msg);
            Result::Err(anyhow!(msg))
        }
    }
}

// ---------------------------------------------------------------------------
// resolve_variant:
// ---------------------------------------------------------------------------
/** The command line wins over the configuration file; basic is the default. */
pub fn resolve_variant(cli: Option<Variant>, config: Option<Variant>) -> Variant {
    cli.or(config).unwrap_or(Variant::Basic)
}

// ***************************************************************************
//                             Config Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_runtime_context:
// ---------------------------------------------------------------------------
pub fn init_runtime_context() -> RuntimeCtx {
    // The application aborts if the configuration file is malformed.
    let parms = get_parms().expect("FAILED to read configuration file.");
    let variant = resolve_variant(HELLO_ARGS.variant, parms.config.variant);
    RuntimeCtx {parms, variant, hello_args: &HELLO_ARGS, hello_dirs: &HELLO_DIRS}
}
