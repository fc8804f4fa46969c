//! FlashKV Bridge CLI
//!
//! A minimal host that drives the C ABI exactly like a language wrapper
//! would: it builds a JSON connection request, creates a client, issues one
//! command with the address of a reply channel as routing token, waits for
//! the callback and closes the client.

use anyhow::{bail, Context};
use flashkv_bridge::ffi::{
    close_client, command, create_client, free_connection_response, free_error_message,
};
use flashkv_bridge::RequestErrorType;
use std::ffi::{c_char, CStr};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// CLI configuration
struct Config {
    /// Host of the server
    host: String,
    /// Port of the server
    port: u16,
    /// Request timeout in milliseconds
    timeout_ms: u64,
    /// Logical database to select
    db: u32,
    verbose: bool,
    /// Command and arguments to send
    args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            timeout_ms: 250,
            db: 0,
            verbose: false,
            args: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host");
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--timeout" | "-t" => {
                    config.timeout_ms =
                        value_of(&args, i, "--timeout").parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid timeout");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--db" | "-n" => {
                    config.db = value_of(&args, i, "--db").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid database number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--verbose" => {
                    config.verbose = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flashkv-bridge-cli version {}", flashkv_bridge::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    config.args = args[i..].to_vec();
                    break;
                }
            }
        }

        if config.args.is_empty() {
            config.args.push("PING".to_string());
        }
        config
    }

    /// The connection request handed to `create_client`.
    fn request_json(&self) -> String {
        serde_json::json!({
            "addresses": [{ "host": self.host, "port": self.port }],
            "request_timeout": self.timeout_ms,
            "database_id": self.db,
            "client_name": "flashkv-bridge-cli",
        })
        .to_string()
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
FlashKV Bridge CLI - drives the C ABI like a host wrapper

USAGE:
    flashkv-bridge-cli [OPTIONS] [COMMAND [ARG ...]]

OPTIONS:
    -h, --host <HOST>      Server host (default: 127.0.0.1)
    -p, --port <PORT>      Server port (default: 6379)
    -t, --timeout <MS>     Request timeout in milliseconds (default: 250)
    -n, --db <DB>          Database to select (default: 0)
        --verbose          Log core activity
    -v, --version          Print version information
        --help             Print this help message

EXAMPLES:
    flashkv-bridge-cli                          # PING
    flashkv-bridge-cli SET name Ariz            # OK
    flashkv-bridge-cli --port 6380 GET name     # Ariz
"#
    );
}

/// What the callback reported.
enum Reply {
    Value(Option<String>),
    Failure(String, RequestErrorType),
}

unsafe extern "C" fn on_success(channel: usize, message: *const c_char) {
    let value = if message.is_null() {
        None
    } else {
        Some(CStr::from_ptr(message).to_string_lossy().into_owned())
    };
    let sender = &*(channel as *const mpsc::Sender<Reply>);
    let _ = sender.send(Reply::Value(value));
}

unsafe extern "C" fn on_failure(channel: usize, message: *const c_char, kind: RequestErrorType) {
    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
    free_error_message(message as *mut c_char);
    let sender = &*(channel as *const mpsc::Sender<Reply>);
    let _ = sender.send(Reply::Failure(text, kind));
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    FmtSubscriber::builder()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let request = config.request_json();
    debug!(request = %request, "Creating client");

    let response = unsafe {
        create_client(
            request.as_ptr(),
            request.len(),
            Some(on_success),
            Some(on_failure),
        )
    };
    let (handle, creation_error) = {
        // SAFETY: create_client never returns null.
        let response = unsafe { &*response };
        (response.conn_ptr, response.error_message())
    };
    unsafe { free_connection_response(response as *mut _) };

    if let Some(message) = creation_error {
        bail!(message);
    }
    info!(host = %config.host, port = config.port, "Connected");

    // The routing token is the address of the reply channel, as a host's
    // completion slot would be.
    let (sender, replies) = mpsc::channel::<Reply>();
    let token = Box::into_raw(Box::new(sender));

    let pointers: Vec<*const u8> = config.args.iter().map(|a| a.as_ptr()).collect();
    let lengths: Vec<usize> = config.args.iter().map(|a| a.len()).collect();
    unsafe {
        command(
            handle,
            token as usize,
            config.args.len(),
            pointers.as_ptr(),
            lengths.as_ptr(),
        )
    };

    let reply = replies
        .recv_timeout(Duration::from_millis(config.timeout_ms) + Duration::from_secs(1))
        .context("no callback received");

    // Blocks until the callback above has fired.
    unsafe { close_client(handle) };
    // SAFETY: the client is closed, nothing refers to the token any more.
    drop(unsafe { Box::from_raw(token) });

    match reply? {
        Reply::Value(Some(value)) => println!("{}", value),
        Reply::Value(None) => println!("(nil)"),
        Reply::Failure(message, kind) => bail!("({:?}) {}", kind, message),
    }
    Ok(())
}
