//! Camera hardware abstractions
//!
//! The synchronisation layer only needs a narrow view of the imaging
//! hardware: a [`Camera`] that can be opened, reconfigured per run and asked
//! for a fixed number of frames. Concrete drivers are reached through a
//! [`CameraConnector`], which the [`nanny::DeviceNanny`] owns explicitly.

pub mod capabilities;
pub mod mock;
pub mod nanny;

pub use capabilities::{Camera, CameraConnector, GrabEvent};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single image as delivered by a camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Raw pixel data, 16-bit little endian
    pub data: Bytes,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    /// Decode the pixel buffer back into 16-bit values.
    pub fn pixels(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Size of the raw buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Trigger source for the exposure sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Camera free-runs on its own clock
    Internal,
    /// Each exposure waits for a hardware trigger from the sequencer
    #[default]
    External,
}

/// Per-run camera configuration.
///
/// Applied on every acquire, cache hit or not, since settings may change
/// between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParams {
    /// Stable identity of the physical camera (serial number)
    pub camera_id: String,
    /// Exposure time
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Analog gain
    pub gain: f64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Trigger source
    pub trigger: TriggerMode,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            camera_id: "mock-0".to_string(),
            exposure: Duration::from_millis(1),
            gain: 1.0,
            width: 64,
            height: 48,
            trigger: TriggerMode::External,
        }
    }
}

impl CameraParams {
    /// Size in bytes of one frame at these settings.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pixels_survive_byte_packing() {
        let frame = Frame::from_u16(2, 2, &[0, 1, 256, u16::MAX]);
        assert_eq!(frame.byte_len(), 8);
        assert_eq!(frame.pixels(), vec![0, 1, 256, u16::MAX]);
    }

    #[test]
    fn params_frame_size() {
        let params = CameraParams {
            width: 10,
            height: 4,
            ..Default::default()
        };
        assert_eq!(params.frame_bytes(), 80);
    }
}
