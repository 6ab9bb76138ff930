use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const CMD_DISABLE_SCREEN: &str = "disable_screen";
pub const CMD_ENABLE_SCREEN: &str = "enable_screen";
pub const CMD_REBOOT: &str = "reboot";
pub const CMD_CHANGE_READING_TIME: &str = "change_reading_time";
pub const CMD_FACTORY_RESET: &str = "factory_reset";

/// Command carried in the body of a sensor-readings response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    DisableScreen,
    EnableScreen,
    Reboot,
    /// Raw minutes string. Validated on the next boot, not here.
    ChangeReadingTime(String),
    FactoryReset,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default, deserialize_with = "lenient_payload")]
    pub payload: String,
}

// Servers occasionally send the interval as a bare number.
fn lenient_payload<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(value)) => value,
        Some(other) => other.to_string(),
    })
}

impl RemoteCommand {
    pub fn from_parts(command: &str, payload: String) -> Self {
        match command {
            CMD_DISABLE_SCREEN => Self::DisableScreen,
            CMD_ENABLE_SCREEN => Self::EnableScreen,
            CMD_REBOOT => Self::Reboot,
            CMD_CHANGE_READING_TIME => Self::ChangeReadingTime(payload),
            CMD_FACTORY_RESET => Self::FactoryReset,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Self::DisableScreen => CMD_DISABLE_SCREEN,
            Self::EnableScreen => CMD_ENABLE_SCREEN,
            Self::Reboot => CMD_REBOOT,
            Self::ChangeReadingTime(_) => CMD_CHANGE_READING_TIME,
            Self::FactoryReset => CMD_FACTORY_RESET,
            Self::Unknown(token) => token,
        }
    }

    pub fn to_envelope(&self) -> CommandEnvelope {
        let payload = match self {
            Self::ChangeReadingTime(payload) => payload.clone(),
            _ => String::new(),
        };
        CommandEnvelope {
            command: self.token().to_string(),
            payload,
        }
    }
}

impl From<CommandEnvelope> for RemoteCommand {
    fn from(envelope: CommandEnvelope) -> Self {
        Self::from_parts(&envelope.command, envelope.payload)
    }
}

/// Malformed bodies and bodies without a `command` key yield `None`.
pub fn decode_response(body: &[u8]) -> Option<RemoteCommand> {
    match serde_json::from_slice::<CommandEnvelope>(body) {
        Ok(envelope) => Some(envelope.into()),
        Err(err) => {
            debug!("response carries no command: {err}");
            None
        }
    }
}
