use std::io::Cursor;

use base64::Engine;
use chrono::{DateTime, Local, SecondsFormat};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;

use crate::detect::{BBox, Detection};

const CROP_JPEG_QUALITY: u8 = 85;

/// Identity of the stream a notification originates from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamIdentity {
    pub name: String,
    pub device_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl From<&BBox> for JobBox {
    fn from(bbox: &BBox) -> Self {
        Self {
            x1: bbox.x1 as i64,
            y1: bbox.y1 as i64,
            x2: bbox.x2 as i64,
            y2: bbox.y2 as i64,
        }
    }
}

/// Outbound detection notification, serialized as the sink's JSON body.
#[derive(Clone, Debug, Serialize)]
pub struct NotificationJob {
    pub object_class: String,
    pub track_id: u64,
    pub confidence: f32,
    pub timestamp: String,
    pub device_name: String,
    pub device_type: String,
    pub bbox: JobBox,
    pub frame_base64: Option<String>,
}

impl NotificationJob {
    /// Build a job for a tracked detection. Returns `None` for untracked ones.
    pub fn build(
        detection: &Detection,
        frame: &RgbImage,
        identity: &StreamIdentity,
        at: DateTime<Local>,
    ) -> Option<Self> {
        let track_id = detection.track_id?;
        Some(Self {
            object_class: detection.label.clone(),
            track_id,
            confidence: detection.confidence,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Micros, false),
            device_name: identity.name.clone(),
            device_type: identity.device_type.clone(),
            bbox: JobBox::from(&detection.bbox),
            frame_base64: encode_crop(frame, &detection.bbox),
        })
    }

    pub fn summary(&self) -> String {
        format!("{}#{}", self.object_class, self.track_id)
    }
}

/// Base64 JPEG of the bbox region, clamped to the frame. `None` when the
/// clamped region is empty or encoding fails.
pub fn encode_crop(frame: &RgbImage, bbox: &BBox) -> Option<String> {
    let (x1, y1, x2, y2) = bbox.clamped(frame.width(), frame.height());
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let crop = image::imageops::crop_imm(frame, x1, y1, x2 - x1, y2 - y1).to_image();

    let mut jpeg = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, CROP_JPEG_QUALITY);
    if let Err(err) = crop.write_with_encoder(encoder) {
        log::error!("failed to encode notification crop: {}", err);
        return None;
    }
    Some(base64::engine::general_purpose::STANDARD.encode(jpeg.into_inner()))
}
