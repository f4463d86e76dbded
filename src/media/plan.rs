use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

/// Codec modes used when the client does not override them. Video is
/// passed through untouched; browser Opus audio is transcoded so the
/// flv/mp4 outputs get a codec they can carry.
pub const DEFAULT_VIDEO_CODEC: &str = "copy";
pub const DEFAULT_AUDIO_CODEC: &str = "aac";

const TEE_SEPARATOR: &str = "|";

/// Requested output set for one publish session, as sent by the client
/// in the `start` message.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DestinationRequest {
    pub rtmp: bool,
    pub rtmp_address: Option<String>,
    pub mp4: bool,
    pub mp4_flags: Option<String>,
    pub hls: bool,
    pub hls_flags: Option<String>,
    pub dash: bool,
    pub dash_flags: Option<String>,
    /// Stream namespace, first path segment under the media root.
    pub stream_app: Option<String>,
    /// Stream name, second path segment under the media root.
    pub stream_name: Option<String>,
    /// Video codec mode override ("copy" or an encoder name).
    pub vc: Option<String>,
    /// Audio codec mode override ("copy" or an encoder name).
    pub ac: Option<String>,
    /// Extra encoder arguments inserted after `-c:v`.
    pub vc_param: Vec<String>,
    /// Extra encoder arguments inserted after `-c:a`.
    pub ac_param: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid rtmp address '{0}': must start with rtmp://")]
    InvalidRtmpAddress(String),
}

/// A single fan-out destination, in tee-map order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sink {
    Rtmp { address: String },
    Mp4 { path: PathBuf },
    Hls { path: PathBuf },
    Dash { path: PathBuf },
}

/// Immutable fan-out specification computed once per start request.
#[derive(Clone, Debug)]
pub struct DestinationPlan {
    pub sinks: Vec<Sink>,
    pub tee_map: String,
    pub out_dir: PathBuf,
    video_codec: String,
    audio_codec: String,
    video_params: Vec<String>,
    audio_params: Vec<String>,
}

impl DestinationPlan {
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// True if any sink writes below `out_dir` (the directory must exist
    /// before the transcoder starts).
    pub fn writes_files(&self) -> bool {
        self.sinks
            .iter()
            .any(|s| !matches!(s, Sink::Rtmp { .. }))
    }

    /// Full transcoder argument vector. The input arrives as an SDP
    /// descriptor on stdin, hence the protocol whitelist and `-i -`.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-protocol_whitelist".into(),
            "pipe,rtp,udp".into(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            self.video_codec.clone(),
        ];
        args.extend(self.video_params.iter().cloned());
        args.push("-c:a".into());
        args.push(self.audio_codec.clone());
        args.extend(self.audio_params.iter().cloned());
        args.extend(
            ["-f", "tee", "-map", "0:a?", "-map", "0:v?"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.tee_map.clone());
        args
    }
}

/// Builds the fan-out plan for today's date. Pure except for the clock.
pub fn build_plan(
    req: &DestinationRequest,
    media_root: &Path,
) -> Result<DestinationPlan, PlanError> {
    build_plan_dated(req, media_root, chrono::Local::now().date_naive())
}

/// Date-injected variant of [`build_plan`]; the archival file is named
/// by capture date.
pub fn build_plan_dated(
    req: &DestinationRequest,
    media_root: &Path,
    date: NaiveDate,
) -> Result<DestinationPlan, PlanError> {
    let app = req.stream_app.as_deref().unwrap_or("live");
    let name = req.stream_name.as_deref().unwrap_or("stream");
    let out_dir = media_root.join(app).join(name);

    let mut sinks = Vec::new();
    let mut elements = Vec::new();

    if req.rtmp {
        if let Some(address) = &req.rtmp_address {
            if !address.starts_with("rtmp://") {
                return Err(PlanError::InvalidRtmpAddress(address.clone()));
            }
            elements.push(format!("[f=flv]{}", address));
            sinks.push(Sink::Rtmp {
                address: address.clone(),
            });
        }
    }

    if req.mp4 {
        let path = out_dir.join(format!("{}.mp4", date.format("%Y-%m-%d")));
        elements.push(format!(
            "{}{}",
            req.mp4_flags.as_deref().unwrap_or(""),
            path.display()
        ));
        sinks.push(Sink::Mp4 { path });
    }

    if req.hls {
        let path = out_dir.join("index.m3u8");
        elements.push(format!(
            "{}{}",
            req.hls_flags.as_deref().unwrap_or(""),
            path.display()
        ));
        sinks.push(Sink::Hls { path });
    }

    if req.dash {
        let path = out_dir.join("index.mpd");
        elements.push(format!(
            "{}{}",
            req.dash_flags.as_deref().unwrap_or(""),
            path.display()
        ));
        sinks.push(Sink::Dash { path });
    }

    Ok(DestinationPlan {
        sinks,
        tee_map: elements.join(TEE_SEPARATOR),
        out_dir,
        video_codec: req
            .vc
            .clone()
            .unwrap_or_else(|| DEFAULT_VIDEO_CODEC.to_string()),
        audio_codec: req
            .ac
            .clone()
            .unwrap_or_else(|| DEFAULT_AUDIO_CODEC.to_string()),
        video_params: req.vc_param.clone(),
        audio_params: req.ac_param.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 29).unwrap()
    }

    #[test]
    fn test_rtmp_then_mp4_order() {
        let req = DestinationRequest {
            rtmp: true,
            rtmp_address: Some("rtmp://host/app/key".to_string()),
            mp4: true,
            ..Default::default()
        };
        let plan = build_plan_dated(&req, Path::new("/media"), date()).unwrap();
        assert_eq!(plan.sinks.len(), 2);
        assert!(matches!(plan.sinks[0], Sink::Rtmp { .. }));
        assert!(matches!(plan.sinks[1], Sink::Mp4 { .. }));
        assert_eq!(
            plan.tee_map,
            "[f=flv]rtmp://host/app/key|/media/live/stream/2026-08-29.mp4"
        );
    }

    #[test]
    fn test_invalid_rtmp_address_rejected() {
        let req = DestinationRequest {
            rtmp: true,
            rtmp_address: Some("http://host/app".to_string()),
            ..Default::default()
        };
        let err = build_plan_dated(&req, Path::new("/media"), date()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidRtmpAddress(_)));
    }

    #[test]
    fn test_empty_request_yields_empty_plan() {
        let req = DestinationRequest::default();
        let plan = build_plan_dated(&req, Path::new("/media"), date()).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.tee_map, "");
    }

    #[test]
    fn test_segmented_outputs_and_flags() {
        let req = DestinationRequest {
            hls: true,
            hls_flags: Some("[hls_time=2:hls_list_size=5]".to_string()),
            dash: true,
            stream_app: Some("tv".to_string()),
            stream_name: Some("cam1".to_string()),
            ..Default::default()
        };
        let plan = build_plan_dated(&req, Path::new("/media"), date()).unwrap();
        assert_eq!(
            plan.tee_map,
            "[hls_time=2:hls_list_size=5]/media/tv/cam1/index.m3u8|/media/tv/cam1/index.mpd"
        );
        assert!(plan.writes_files());
    }

    #[test]
    fn test_ffmpeg_args_shape() {
        let req = DestinationRequest {
            rtmp: true,
            rtmp_address: Some("rtmp://host/app/key".to_string()),
            vc: Some("libx264".to_string()),
            vc_param: vec!["-preset".to_string(), "veryfast".to_string()],
            ..Default::default()
        };
        let plan = build_plan_dated(&req, Path::new("/media"), date()).unwrap();
        let args = plan.ffmpeg_args();
        assert_eq!(args[0], "-protocol_whitelist");
        assert_eq!(args[1], "pipe,rtp,udp");
        assert_eq!(args[2], "-i");
        assert_eq!(args[3], "-");
        let cv = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[cv + 1], "libx264");
        assert_eq!(args[cv + 2], "-preset");
        assert_eq!(args[cv + 3], "veryfast");
        let ca = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[ca + 1], DEFAULT_AUDIO_CODEC);
        assert_eq!(args.last().unwrap(), &plan.tee_map);
        let tee = args.iter().position(|a| a == "tee").unwrap();
        assert_eq!(args[tee - 1], "-f");
    }

    #[test]
    fn test_rtmp_flag_without_address_is_skipped() {
        let req = DestinationRequest {
            rtmp: true,
            mp4: true,
            ..Default::default()
        };
        let plan = build_plan_dated(&req, Path::new("/media"), date()).unwrap();
        assert_eq!(plan.sinks.len(), 1);
        assert!(matches!(plan.sinks[0], Sink::Mp4 { .. }));
    }
}
