//! Line format shared by the kernel's `log` sinks.

use core::fmt::{self, Write};
use log::{Level, Record};

/// Fixed-width level tag so messages line up on the console.
pub fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// One record per line: `[LEVEL] message`.
pub fn write_record(out: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}", level_tag(record.level()), record.args())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn records_render_one_per_line() {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder().level(Level::Warn).args(format_args!("sem: {} freed", 3)).build(),
        )
        .unwrap();
        write_record(
            &mut out,
            &Record::builder().level(Level::Debug).args(format_args!("pipe: up")).build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN ] sem: 3 freed\n[DEBUG] pipe: up\n");
    }
}
