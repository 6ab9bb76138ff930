//! Seams to the vendor services the node drives.

use crate::{
    error::{DisplayError, SensorError, TransportError},
    screen::Screen,
    types::HttpReply,
};

/// Blocking read of the single scalar the node reports (degrees Celsius).
pub trait SensorReader {
    fn read(&mut self) -> Result<f32, SensorError>;
}

pub trait StatusDisplay {
    fn render(&mut self, screen: &Screen) -> Result<(), DisplayError>;

    fn clear(&mut self) -> Result<(), DisplayError>;
}

pub trait ReportTransport {
    /// POSTs a JSON body and returns the raw reply.
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError>;
}
