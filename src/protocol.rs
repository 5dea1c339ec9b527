use std::fmt::Display;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Maximum length of a single JSON line on the control channel.
pub(crate) const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

macro_rules! random_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub(crate) struct $name(pub(crate) String);

        impl $name {
            pub(crate) fn random() -> Self {
                $name(format!("{:016x}", rand::rng().random::<u64>()))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_owned())
            }
        }
    };
}

random_id!(ClientId);
random_id!(RequestId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TunnelType {
    Http,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct AuthenticateData {
    #[serde(rename = "type")]
    pub(crate) tunnel_type: TunnelType,
    // The local host being shared by the client, for logging.
    #[serde(default)]
    pub(crate) host: Option<String>,
    #[serde(default)]
    pub(crate) subdomain: Option<String>,
    #[serde(default)]
    pub(crate) hostname: Option<String>,
    #[serde(default)]
    pub(crate) auth_token: Option<String>,
    // The local port being shared, for TCP tunnels.
    #[serde(default)]
    pub(crate) port: Option<u16>,
}

// Messages sent from clients to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientMessage {
    Authenticate(AuthenticateData),
    RegisterProxy {
        request_id: RequestId,
        client_id: ClientId,
    },
    RegisterTcpProxy {
        client_id: ClientId,
        tcp_request_id: RequestId,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct RegisterProxyData {
    request_id: RequestId,
    client_id: ClientId,
}

#[derive(Deserialize)]
struct RegisterTcpProxyData {
    client_id: ClientId,
    tcp_request_id: RequestId,
}

impl ClientMessage {
    // Decode one line of the control channel.
    // Returns Ok(None) for well-formed envelopes with an unknown event name.
    pub(crate) fn decode(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let Envelope { event, data } = serde_json::from_str(line)?;
        let data = match data {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(data) => data,
        };
        let message = match event.as_str() {
            "authenticate" => ClientMessage::Authenticate(serde_json::from_value(data)?),
            "registerProxy" => {
                let RegisterProxyData {
                    request_id,
                    client_id,
                } = serde_json::from_value(data)?;
                ClientMessage::RegisterProxy {
                    request_id,
                    client_id,
                }
            }
            "registerTcpProxy" => {
                let RegisterTcpProxyData {
                    client_id,
                    tcp_request_id,
                } = serde_json::from_value(data)?;
                ClientMessage::RegisterTcpProxy {
                    client_id,
                    tcp_request_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

// Messages sent from the broker to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub(crate) enum ServerMessage {
    Authenticated {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        shared_port: Option<u16>,
        client_id: ClientId,
    },
    AuthenticationFailed {
        message: String,
    },
    SubdomainTaken {
        message: String,
    },
    HostnameTaken {
        message: String,
    },
    Info {
        message: String,
    },
    CreateProxy {
        request_id: RequestId,
        client_id: ClientId,
    },
    CreateProxyForTcp {
        client_id: ClientId,
        tcp_request_id: RequestId,
        port: u16,
    },
}

impl ServerMessage {
    pub(crate) fn encode(&self) -> String {
        // Serializing these variants cannot fail: every field is a string or integer.
        serde_json::to_string(self).unwrap_or_default()
    }
}
