use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser};
use humantime::Duration;

#[derive(Debug, Clone, Args)]
pub struct Messages {
    /// Message sent to every client after a successful authentication.
    #[arg(
        long = "message-of-the-day",
        default_value_t = String::from("Thank you for using burrow."),
        value_name = "MESSAGE"
    )]
    pub message_of_the_day: String,

    /// Message sent when the provided authentication token is invalid.
    #[arg(
        long = "invalid-auth-token-message",
        default_value_t = String::from("Authentication failed. Please check your authentication token and try again."),
        value_name = "MESSAGE"
    )]
    pub invalid_auth_token: String,

    /// Message sent when the requested subdomain is in use. `:subdomain` is replaced with the subdomain.
    #[arg(
        long = "subdomain-taken-message",
        default_value_t = String::from("The chosen subdomain :subdomain is already taken. Please choose a different subdomain."),
        value_name = "MESSAGE"
    )]
    pub subdomain_taken: String,

    /// Message sent when the requested subdomain is reserved for a different user.
    #[arg(
        long = "subdomain-reserved-message",
        default_value_t = String::from("The chosen subdomain :subdomain is reserved for a different user."),
        value_name = "MESSAGE"
    )]
    pub subdomain_reserved: String,

    /// Message sent when the requested subdomain is not a valid DNS label.
    #[arg(
        long = "subdomain-invalid-message",
        default_value_t = String::from("The chosen subdomain :subdomain is not valid."),
        value_name = "MESSAGE"
    )]
    pub subdomain_invalid: String,

    /// Notice sent when a user may not pick their own subdomain and a random one is assigned.
    #[arg(
        long = "custom-subdomain-unauthorized-message",
        default_value_t = String::from("You are not allowed to specify custom subdomains. Assigning a random subdomain instead."),
        value_name = "MESSAGE"
    )]
    pub custom_subdomain_unauthorized: String,

    /// Message sent when a user may not pick their own hostname.
    #[arg(
        long = "custom-hostname-unauthorized-message",
        default_value_t = String::from("You are not allowed to specify custom hostnames."),
        value_name = "MESSAGE"
    )]
    pub custom_hostname_unauthorized: String,

    /// Message sent when the requested hostname doesn't match any of the user's reservations.
    /// `:hostname` is replaced with the hostname.
    #[arg(
        long = "hostname-invalid-message",
        default_value_t = String::from("The chosen hostname :hostname is not registered for your account."),
        value_name = "MESSAGE"
    )]
    pub hostname_invalid: String,

    /// Message sent when the requested hostname is in use.
    #[arg(
        long = "hostname-taken-message",
        default_value_t = String::from("The chosen hostname :hostname is already taken."),
        value_name = "MESSAGE"
    )]
    pub hostname_taken: String,

    /// Message sent when a user may not share TCP ports.
    #[arg(
        long = "tcp-sharing-unauthorized-message",
        default_value_t = String::from("You are not allowed to share TCP ports."),
        value_name = "MESSAGE"
    )]
    pub tcp_sharing_unauthorized: String,

    /// Message sent when every port in the TCP range is in use.
    #[arg(
        long = "no-free-tcp-port-message",
        default_value_t = String::from("There are no free TCP ports available on this server. Please try again later."),
        value_name = "MESSAGE"
    )]
    pub no_free_tcp_port_available: String,

    /// Notice sent right before a connection is closed for reaching the maximum connection length.
    #[arg(
        long = "maximum-connection-length-message",
        default_value_t = String::from("Your connection has reached the maximum connection length and will be closed."),
        value_name = "MESSAGE"
    )]
    pub maximum_connection_length_reached: String,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// The root domain of the application. Tunnels are served under its subdomains.
    #[arg(long, value_parser = validate_domain)]
    pub domain: String,

    /// Address to listen for all connections.
    #[arg(long, default_value_t = IpAddr::from([0u16; 8]), value_name = "ADDRESS")]
    pub listen_address: IpAddr,

    /// Port to listen for public HTTP connections.
    #[arg(long, default_value_t = 8080, value_parser = validate_port, value_name = "PORT")]
    pub http_port: u16,

    /// Port to listen for control and proxy connections from clients.
    #[arg(long, default_value_t = 8081, value_parser = validate_port, value_name = "PORT")]
    pub control_port: u16,

    /// Subdomain reserved for the administration interface. No tunnel can bind it.
    #[arg(long, default_value_t = String::from("admin"), value_name = "SUBDOMAIN")]
    pub admin_subdomain: String,

    /// Require clients to provide a valid authentication token.
    #[arg(long, default_value_t = false)]
    pub validate_auth_tokens: bool,

    /// JSON file containing users, reserved subdomains, and reserved hostnames.
    /// If missing, the repositories start empty.
    #[arg(long, value_name = "FILE")]
    pub users_file: Option<PathBuf>,

    /// First port (inclusive) of the range leased to TCP tunnels.
    #[arg(long, default_value_t = 50000, value_parser = validate_port, value_name = "PORT")]
    pub tcp_port_range_start: u16,

    /// Last port (inclusive) of the range leased to TCP tunnels.
    #[arg(long, default_value_t = 50999, value_parser = validate_port, value_name = "PORT")]
    pub tcp_port_range_end: u16,

    /// Maximum duration of a control connection before it is forcefully closed.
    ///
    /// By default, connections are not limited.
    #[arg(long, value_name = "DURATION")]
    pub maximum_connection_length: Option<Duration>,

    /// Time to wait for a client to open a proxy connection for a public request.
    #[arg(long, default_value = "10s", value_name = "DURATION")]
    pub proxy_request_timeout: Duration,

    /// Time until an HTTP request sent through a tunnel is canceled.
    ///
    /// By default, requests are not timed out once the proxy connection is established.
    #[arg(long, value_name = "DURATION")]
    pub http_request_timeout: Option<Duration>,

    /// How long until TCP connections (including Websockets) are automatically closed.
    ///
    /// By default, these connections are not terminated by the broker.
    #[arg(long, value_name = "DURATION")]
    pub tcp_connection_timeout: Option<Duration>,

    /// Grace period for a new connection to send its first message before it is dropped.
    #[arg(long, default_value = "5s", value_name = "DURATION")]
    pub idle_connection_timeout: Duration,

    /// Buffer size for bidirectional copying.
    #[arg(long, default_value_t = 32_768, value_name = "BYTES")]
    pub buffer_size: usize,

    /// Length of randomly assigned subdomains.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(4..=63), value_name = "LENGTH")]
    pub random_subdomain_length: u8,

    #[command(flatten)]
    pub messages: Messages,
}

fn validate_domain(domain: &str) -> Result<String, String> {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty()
        || domain.split('.').any(|label| {
            label.is_empty()
                || label.len() > 63
                || !label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
    {
        return Err("invalid domain".into());
    }
    Ok(domain)
}

fn validate_port(port: &str) -> Result<u16, String> {
    match port.parse::<u16>() {
        Err(err) => Err(format!("{err}")),
        Ok(0) => Err("port cannot be zero".into()),
        Ok(port) => Ok(port),
    }
}
