use serde::Serialize;

/// All relay traffic stays on loopback; the transcoder listens there.
pub const RELAY_IP: &str = "127.0.0.1";

pub const AUDIO_CODEC: &str = "opus";
pub const AUDIO_PAYLOAD: u8 = 109;
pub const AUDIO_CLOCK_RATE: u32 = 48000;
pub const AUDIO_CHANNELS: u8 = 2;

pub const VIDEO_CODEC: &str = "h264";
pub const VIDEO_PAYLOAD: u8 = 96;
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// UDP port pair a session republishes its negotiated tracks on.
/// Allocated per session, unique among live sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RelayPorts {
    pub audio: u16,
    pub video: u16,
}

impl RelayPorts {
    /// Renders the session description fed to the transcoder's stdin,
    /// describing the two loopback RTP streams it should demux.
    pub fn to_input_sdp(&self) -> String {
        format!(
            "c=IN IP4 {ip}\n\
             m=audio {ap} RTP {apt}\n\
             a=rtpmap:{apt} {ac}/{acr}/{ach}\n\
             m=video {vp} RTP {vpt}\n\
             a=rtpmap:{vpt} {vc}/{vcr}\n",
            ip = RELAY_IP,
            ap = self.audio,
            apt = AUDIO_PAYLOAD,
            ac = AUDIO_CODEC,
            acr = AUDIO_CLOCK_RATE,
            ach = AUDIO_CHANNELS,
            vp = self.video,
            vpt = VIDEO_PAYLOAD,
            vc = VIDEO_CODEC,
            vcr = VIDEO_CLOCK_RATE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_sdp_lists_both_streams() {
        let ports = RelayPorts {
            audio: 5004,
            video: 5006,
        };
        let sdp = ports.to_input_sdp();
        assert!(sdp.starts_with("c=IN IP4 127.0.0.1\n"));
        assert!(sdp.contains("m=audio 5004 RTP 109"));
        assert!(sdp.contains("a=rtpmap:109 opus/48000/2"));
        assert!(sdp.contains("m=video 5006 RTP 96"));
        assert!(sdp.contains("a=rtpmap:96 h264/90000"));
    }
}
