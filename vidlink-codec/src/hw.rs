//! Hardware H.264 encoder discovery.
//!
//! Candidates are tried in order; the caller falls back to the software encoder
//! when none is registered or the chosen one fails to open.

use ffmpeg_next::Dictionary;

const HW_H264_ENCODERS: &[&str] = &["h264_nvenc", "h264_qsv", "h264_vaapi", "h264_v4l2m2m"];

/// First hardware H.264 encoder this FFmpeg build registers.
pub fn find_hw_encoder() -> Option<ffmpeg_next::Codec> {
    for name in HW_H264_ENCODERS {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Lowest-latency private options for a hardware encoder. The x264 options do not apply.
pub fn low_latency_options(name: &str) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    match name {
        "h264_nvenc" => {
            opts.set("preset", "p1");
            opts.set("tune", "ull");
            opts.set("zerolatency", "1");
            opts.set("delay", "0");
        }
        "h264_qsv" => {
            opts.set("preset", "veryfast");
            opts.set("async_depth", "1");
        }
        _ => {}
    }
    opts
}
