/// FixIIR log scraping: the three metric announcements FloPoCo prints at loglevel=1.
///
/// Each metric has its own named pattern. FloPoCo has printed both a
/// "Computed ..." and a bare phrasing over time; a new phrasing is one more
/// alternative in the pattern, nothing else changes.
use regex::Regex;
use std::sync::LazyLock;

/// Signed decimal with optional fraction and exponent (`-1.5e-3`, `.25`, `7.`).
///
/// Digits are ASCII `[0-9]`, not `\d` (Unicode in `regex`), so every match
/// is something `f64::from_str` accepts.
const FLOAT: &str = r"([+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?)";
/// Signed ASCII integer.
const INT: &str = r"([+-]?[0-9]+)";

/// `Computed filter worst-case peak gain: H=<float>` or `Filter worst-case peak gain: H=<float>`.
pub static H_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:Computed filter worst-case peak gain|Filter worst-case peak gain):\s*H={FLOAT}"
    ))
    .unwrap()
});

/// `Computed error amplification worst-case peak gain: Heps=<float>` or the bare form.
pub static HEPS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:Computed error amplification worst-case peak gain|Error amplification worst-case peak gain):\s*Heps={FLOAT}"
    ))
    .unwrap()
});

/// `Building an IIR filter faithful to lsbExt=<int>`.
pub static LSB_EXT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"Building an IIR filter faithful to\s*lsbExt={INT}")).unwrap()
});

/// Whatever metrics a log contains. Absent fields were not announced (or did not parse).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogMetrics {
    pub h: Option<f64>,
    pub heps: Option<f64>,
    pub lsb_ext: Option<i64>,
}

/// First capture of `pattern` in `log`, parsed as `T`.
fn first_capture<T: std::str::FromStr>(pattern: &Regex, name: &str, log: &str) -> Option<T> {
    let caps = pattern.captures(log)?;
    let text = caps.get(1)?.as_str();
    match text.parse() {
        Ok(v) => {
            tracing::debug!(metric = name, value = text, "metric announcement matched");
            Some(v)
        }
        Err(_) => {
            tracing::debug!(metric = name, value = text, "metric announcement did not parse");
            None
        }
    }
}

/// Worst-case peak gain H, first announcement wins.
pub fn find_h(log: &str) -> Option<f64> {
    first_capture(&H_PATTERN, "H", log)
}

/// Error-amplification peak gain Heps, first announcement wins.
pub fn find_heps(log: &str) -> Option<f64> {
    first_capture(&HEPS_PATTERN, "Heps", log)
}

/// Guard-bit extension lsbExt, first announcement wins.
pub fn find_lsb_ext(log: &str) -> Option<i64> {
    first_capture(&LSB_EXT_PATTERN, "lsbExt", log)
}

/// Run all three matchers over a log.
///
/// Used by both the clean-exit and the timeout path, so a partial log is read
/// exactly the way a complete one is.
pub fn extract(log: &str) -> LogMetrics {
    LogMetrics {
        h: find_h(log),
        heps: find_heps(log),
        lsb_ext: find_lsb_ext(log),
    }
}
