use std::str::FromStr;

use tracing::Level;

/// Map a configured level name to a tracing level. `warning` is accepted as
/// an alias; anything unrecognized is `None`.
pub fn parse_level(name: &str) -> Option<Level> {
    let name = name.trim();
    if name.eq_ignore_ascii_case("warning") {
        return Some(Level::WARN);
    }
    Level::from_str(name).ok()
}

/// Install the fmt subscriber at the configured `log.level` and return the
/// level in effect. Unknown names fall back to `info`.
///
/// A second call keeps the first subscriber.
pub fn init(level: &str) -> Level {
    let lvl = parse_level(level).unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
    lvl
}
