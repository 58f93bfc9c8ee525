//! Classification of FFmpeg stderr into fixed failure codes.

use std::sync::LazyLock;

use regex::Regex;

pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

/// Patterns tried in order; the first match wins.
static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"Unsupported input format:(.*)").unwrap(),
            "UNSUPPORTED_INPUT_FORMAT",
        ),
        (
            Regex::new(r"Bit depth (\d*) is not supported").unwrap(),
            "BIT_DEPTH_NOT_SUPPORTED",
        ),
        (
            Regex::new(r"channel element (.*?) is not allocated").unwrap(),
            "CHANNEL_ELEMENT_NOT_ALLOCATED",
        ),
        (
            Regex::new(r"Non-monotonic DTS; previous: (.*?), current: (.*?);").unwrap(),
            "NON_MONOTONOUS_DTS",
        ),
        (
            Regex::new(r"Packet corrupt \(stream = (\d+), dts = (\d+)\)").unwrap(),
            "CORRUPT_INPUT",
        ),
        (
            Regex::new(r"corrupt input packet in stream (\d+)").unwrap(),
            "CORRUPT_INPUT",
        ),
    ]
});

/// Literal fragments checked after the patterns, in order.
const KNOWN: &[(&str, &str)] = &[
    ("Prediction is not allowed in AAC-LC", "PREDICTION_IS_NOT_ALLOWED_IN_AAC_LC"),
    ("Invalid NAL unit size", "INVALID_NAL_UNIT_SIZE"),
    ("Non-monotonous DTS in output stream", "NON_MONOTONOUS_DTS"),
    (
        "Failed to inject frame into filter network: Function not implemented",
        "FUNCTION_NOT_IMPLEMENTED",
    ),
    ("Generic error in an external library", "GENERIC_ERROR_IN_EXTERNAL_LIBRARY"),
    ("Invalid data found when processing input", "INVALID_DATA"),
];

/// A classified failure: code plus the fragment that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub code: &'static str,
    pub message: String,
}

pub fn classify_stderr(stderr: &str) -> Classified {
    for (re, code) in PATTERNS.iter() {
        if let Some(m) = re.find(stderr) {
            return Classified {
                code: *code,
                message: m.as_str().to_string(),
            };
        }
    }

    for (fragment, code) in KNOWN {
        if stderr.contains(fragment) {
            return Classified {
                code: *code,
                message: fragment.to_string(),
            };
        }
    }

    let last = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ffmpeg exited with non-zero status");
    Classified {
        code: UNKNOWN_ERROR,
        message: last.trim().to_string(),
    }
}
