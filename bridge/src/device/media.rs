//! Preview image and camera endpoints
//!
//! Only addresses and hints are produced here; fetching and relaying are
//! left to external collaborators.

use serde::Serialize;

use crate::device::machine::DeviceView;
use crate::model::capability::CameraKind;
use crate::model::status::PrintStatus;

pub const MJPEG_PORT: u16 = 8080;
pub const WEBRTC_SIGNALING_PORT: u16 = 8000;
const PREVIEW_PATH: &str = "/downloads/original/current_print_image.png";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub camera: CameraKind,
    pub stream_url: Option<String>,
    pub signaling_url: Option<String>,
    pub fetch_preview: bool,
    pub preview_urls: Vec<String>,
}

/// A preview is worth fetching while a named job is loaded or just finished.
pub fn should_fetch_preview(status: Option<PrintStatus>, file_name: Option<&str>) -> bool {
    let has_file = file_name.is_some_and(|name| !name.trim().is_empty());
    let relevant = status.is_some_and(|s| s.is_job_active() || s == PrintStatus::Completed);
    has_file && relevant
}

/// HTTPS first, HTTP as fallback.
pub fn preview_urls(host: &str) -> Vec<String> {
    let host = url_host(host);
    vec![
        format!("https://{}{}", host, PREVIEW_PATH),
        format!("http://{}{}", host, PREVIEW_PATH),
    ]
}

pub fn stream_url(host: &str) -> String {
    format!("http://{}:{}/?action=stream", url_host(host), MJPEG_PORT)
}

pub fn signaling_url(host: &str) -> String {
    format!("http://{}:{}/call/webrtc_local", url_host(host), WEBRTC_SIGNALING_PORT)
}

pub fn media_info(view: &DeviceView) -> MediaInfo {
    let host = view.identity.host.as_str();
    let camera = view.capabilities.camera;
    let available = !host.is_empty() && !view.power_off;
    MediaInfo {
        camera,
        stream_url: (available && camera == CameraKind::Mjpeg).then(|| stream_url(host)),
        signaling_url: (available && camera == CameraKind::WebRtc).then(|| signaling_url(host)),
        fetch_preview: available
            && should_fetch_preview(view.status, view.telemetry.job.file_name.as_deref()),
        preview_urls: if host.is_empty() { Vec::new() } else { preview_urls(host) },
    }
}

fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_fetch_preview() {
        assert!(should_fetch_preview(Some(PrintStatus::Printing), Some("cube.gcode")));
        assert!(should_fetch_preview(Some(PrintStatus::Completed), Some("cube.gcode")));
        assert!(should_fetch_preview(Some(PrintStatus::Pausing), Some("cube.gcode")));
        assert!(!should_fetch_preview(Some(PrintStatus::Printing), Some("  ")));
        assert!(!should_fetch_preview(Some(PrintStatus::Idle), Some("cube.gcode")));
        assert!(!should_fetch_preview(None, Some("cube.gcode")));
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            preview_urls("192.168.1.20"),
            vec![
                "https://192.168.1.20/downloads/original/current_print_image.png",
                "http://192.168.1.20/downloads/original/current_print_image.png",
            ]
        );
        assert_eq!(stream_url("192.168.1.20"), "http://192.168.1.20:8080/?action=stream");
        assert_eq!(signaling_url("fe80::2"), "http://[fe80::2]:8000/call/webrtc_local");
    }

    #[test]
    fn test_media_info_follows_camera_kind() {
        let mut view = DeviceView::empty("k2");
        view.identity.host = "10.0.0.8".to_string();
        view.capabilities.camera = CameraKind::WebRtc;
        view.status = Some(PrintStatus::Printing);
        view.telemetry.job.file_name = Some("benchy.gcode".to_string());

        let info = media_info(&view);
        assert_eq!(info.stream_url, None);
        assert_eq!(info.signaling_url.as_deref(), Some("http://10.0.0.8:8000/call/webrtc_local"));
        assert!(info.fetch_preview);

        view.power_off = true;
        let info = media_info(&view);
        assert_eq!(info.signaling_url, None);
        assert!(!info.fetch_preview);
    }
}
