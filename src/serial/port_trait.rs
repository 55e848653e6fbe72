//! Trait abstraction for opening serial ports to enable testing

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, StationError};

/// Byte stream to a radio: anything readable and writable asynchronously
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// Opens a connection to a serial device
#[async_trait]
pub trait PortConnector: Send + Sync {
    /// Open `path` at `baud_rate` and hand back the byte stream
    async fn connect(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialIo>>;
}

/// Connector backed by `tokio_serial`, 8N1 without flow control
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialConnector;

#[async_trait]
impl PortConnector for TokioSerialConnector {
    async fn connect(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialIo>> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| StationError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(Box::new(port))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_port_with_invalid_path_returns_error() {
        let result = TokioSerialConnector
            .connect("/dev/nonexistent_serial_device_12345", 115_200)
            .await;

        match result {
            Err(StationError::Serial(msg)) => {
                assert!(msg.contains("/dev/nonexistent_serial_device_12345"));
                assert!(msg.contains("Failed to open"));
            }
            Err(other) => panic!("Expected Serial error, got: {:?}", other),
            Ok(_) => panic!("Expected Serial error, got an open port"),
        }
    }

    #[tokio::test]
    async fn test_mock_connector_fails_when_empty() {
        let connector = mocks::MockConnector::new();
        assert!(connector.connect("/dev/ttyACM0", 115_200).await.is_err());
        assert_eq!(connector.attempt_count(), 1);
    }
}
