//! Display formatting for elapsed-time values stored as whole seconds.

/// Formats a duration as zero-padded "HH:MM". Absent or non-positive values
/// render as "00:00"; seconds are floored to whole minutes; hours grow past
/// 99 without day rollover.
pub fn format_hh_mm(total_seconds: Option<i64>) -> String {
    let total_seconds = match total_seconds {
        Some(secs) if secs > 0 => secs,
        _ => return "00:00".to_string(),
    };
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    format!("{:02}:{:02}", hours, minutes)
}

/// Formats a closed time entry's duration as zero-padded "HH:MM:SS".
pub fn format_hh_mm_ss(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_zero_render_as_zero() {
        assert_eq!(format_hh_mm(None), "00:00");
        assert_eq!(format_hh_mm(Some(0)), "00:00");
    }

    #[test]
    fn minutes_are_floored() {
        // 90 minutes
        assert_eq!(format_hh_mm(Some(90 * 60)), "01:30");
        // 59s floors to zero minutes
        assert_eq!(format_hh_mm(Some(59)), "00:00");
        assert_eq!(format_hh_mm(Some(61)), "00:01");
    }

    #[test]
    fn hours_exceed_two_digits_without_rollover() {
        assert_eq!(format_hh_mm(Some(50 * 3600 + 30 * 60)), "50:30");
        assert_eq!(format_hh_mm(Some(120 * 3600 + 5 * 60)), "120:05");
    }

    #[test]
    fn negative_values_clamp_to_zero() {
        assert_eq!(format_hh_mm(Some(-30)), "00:00");
        assert_eq!(format_hh_mm_ss(-30), "00:00:00");
    }

    #[test]
    fn hh_mm_ss_keeps_seconds() {
        assert_eq!(format_hh_mm_ss(3600), "01:00:00");
        assert_eq!(format_hh_mm_ss(3661), "01:01:01");
        assert_eq!(format_hh_mm_ss(0), "00:00:00");
    }
}
