use crate::types::ConnectionStatus;

/// Content for the 128x64 status display. Platforms turn it into pixels.
#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    AccessPoint {
        ssid: &'static str,
        password: &'static str,
        device_id: String,
    },
    Reading {
        celsius: f32,
        device_id: String,
        status: ConnectionStatus,
    },
    SensorFault {
        device_id: String,
        status: ConnectionStatus,
    },
    Message {
        title: String,
        detail: String,
    },
}

impl Screen {
    pub fn message(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Message {
            title: title.into(),
            detail: detail.into(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::AccessPoint {
                ssid,
                password,
                device_id,
            } => vec![
                "Setup mode".to_string(),
                format!("WiFi: {ssid}"),
                format!("Pass: {password}"),
                format!("ID: {device_id}"),
            ],
            Self::Reading {
                celsius,
                device_id,
                status,
            } => vec![
                "TempGuard".to_string(),
                format!("{celsius:.1} C"),
                format!("ID: {device_id}"),
                format!("Net: {}", status.as_str()),
            ],
            Self::SensorFault { device_id, status } => vec![
                "TempGuard".to_string(),
                "Sensor error".to_string(),
                format!("ID: {device_id}"),
                format!("Net: {}", status.as_str()),
            ],
            Self::Message { title, detail } if detail.is_empty() => vec![title.clone()],
            Self::Message { title, detail } => vec![title.clone(), detail.clone()],
        }
    }
}
