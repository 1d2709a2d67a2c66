/// Renders a transfer rate for display, e.g. `512 B/s`, `1.5 KB/s`, `3.2 MB/s`.
pub fn format_speed(bytes_per_second: f64) -> String {
    const KB: f64 = 1024.;
    const MB: f64 = 1024. * 1024.;

    if bytes_per_second < KB {
        format!("{:.0} B/s", bytes_per_second)
    } else if bytes_per_second < MB {
        format!("{:.1} KB/s", bytes_per_second / KB)
    } else {
        format!("{:.1} MB/s", bytes_per_second / MB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.), "0 B/s");
        assert_eq!(format_speed(1023.), "1023 B/s");
        assert_eq!(format_speed(1536.), "1.5 KB/s");
        assert_eq!(format_speed(3. * 1024. * 1024.), "3.0 MB/s");
    }
}
