mod auth_prevent_unauthorized_actions;
mod common;
mod connection_close_removes_bindings;
mod http_duplicate_and_reserved_subdomains;
mod http_hostname_reservations;
mod http_missing_subdomain;
mod http_proxy_timeout;
mod tcp_port_pool_exhaustion;
