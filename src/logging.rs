use std::io::Write;

/// Install the process-wide logger. `tag` tells daemon and monitor lines apart
/// when both write to the same journal.
pub fn init(tag: &str) {
    let tag = tag.to_string();
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format(move |buf, record| {
            writeln!(
                buf,
                "[{} {} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                tag,
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}
