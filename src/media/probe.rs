//! ffprobe parsing: stream layout and durations of a media file.

use crate::error::MediaError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What the pipeline needs to know about a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Container duration in seconds.
    pub duration_secs: f64,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u32,
}

impl MediaInfo {
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    duration: Option<String>,
}

/// ffprobe arguments producing the JSON [`parse_probe_output`] expects.
pub fn probe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "quiet".into(),
        "-print_format".into(),
        "json".into(),
        "-show_format".into(),
        "-show_streams".into(),
        path.to_string_lossy().to_string(),
    ]
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(json: &str, path: &Path) -> Result<MediaInfo, MediaError> {
    let probe: FfprobeOutput = serde_json::from_str(json).map_err(|e| MediaError::Probe {
        path: path.to_path_buf(),
        detail: format!("invalid ffprobe JSON: {e}"),
    })?;

    let format_duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_seconds);

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .map(|s| VideoStreamInfo {
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
            fps: s
                .avg_frame_rate
                .as_deref()
                .and_then(parse_frame_rate)
                .or_else(|| s.r_frame_rate.as_deref().and_then(parse_frame_rate))
                .unwrap_or(0.0),
        });

    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioStreamInfo {
            duration_secs: s
                .duration
                .as_deref()
                .and_then(parse_seconds)
                .or(format_duration)
                .unwrap_or(0.0),
            sample_rate: s
                .sample_rate
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or(0),
            channels: s.channels.unwrap_or(0),
        });

    if video.is_none() && audio.is_none() {
        return Err(MediaError::Probe {
            path: path.to_path_buf(),
            detail: "no audio or video stream".into(),
        });
    }

    Ok(MediaInfo {
        duration_secs: format_duration.unwrap_or(0.0),
        video,
        audio,
    })
}

fn parse_seconds(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}

/// Parse a frame rate string ("24/1", "30000/1001" or "29.97").
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den > 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.trim().parse().ok().filter(|f: &f64| *f > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIP_WITH_AUDIO: &str = r#"{
        "streams": [
            {"codec_type": "video", "width": 1280, "height": 720,
             "r_frame_rate": "24/1", "avg_frame_rate": "24/1", "duration": "12.000000"},
            {"codec_type": "audio", "sample_rate": "44100", "channels": 2, "duration": "11.52"}
        ],
        "format": {"duration": "12.000000"}
    }"#;

    #[test]
    fn parses_video_and_audio() {
        let info = parse_probe_output(CLIP_WITH_AUDIO, Path::new("c.mp4")).unwrap();
        let v = info.video.unwrap();
        assert_eq!((v.width, v.height), (1280, 720));
        assert_eq!(v.fps, 24.0);
        let a = info.audio.unwrap();
        assert_eq!(a.sample_rate, 44_100);
        assert_eq!(a.channels, 2);
        assert!((a.duration_secs - 11.52).abs() < 1e-9);
        assert_eq!(info.duration_secs, 12.0);
    }

    #[test]
    fn audio_only_file_uses_format_duration() {
        let json = r#"{"streams":[{"codec_type":"audio","sample_rate":"24000","channels":1}],
                       "format":{"duration":"3.25"}}"#;
        let info = parse_probe_output(json, Path::new("n.wav")).unwrap();
        assert!(info.video.is_none());
        assert_eq!(info.audio.unwrap().duration_secs, 3.25);
    }

    #[test]
    fn silent_clip_has_no_audio() {
        let json = r#"{"streams":[{"codec_type":"video","width":854,"height":480,
                       "avg_frame_rate":"0/0","r_frame_rate":"15/1"}],
                       "format":{"duration":"4.0"}}"#;
        let info = parse_probe_output(json, Path::new("s.mp4")).unwrap();
        assert!(!info.has_audio());
        assert_eq!(info.video.unwrap().fps, 15.0);
    }

    #[test]
    fn empty_streams_is_an_error() {
        let err = parse_probe_output(r#"{"streams":[]}"#, Path::new("x")).unwrap_err();
        assert!(err.to_string().contains("no audio or video"));
    }

    #[test]
    fn frame_rate_forms() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }
}
