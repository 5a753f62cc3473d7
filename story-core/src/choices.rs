//! Extracting a bounded list of choices from free-form model output.

/// Shown when the model's choice list yields nothing usable.
pub const DEFAULT_CHOICES: [&str; 3] = ["繼續前進", "環顧四周", "與人交談"];

/// Shown when the choice request itself fails.
pub const FALLBACK_CHOICES: [&str; 3] = ["繼續探索", "仔細觀察周圍", "尋找線索"];

pub fn default_choices() -> Vec<String> {
    DEFAULT_CHOICES.iter().map(|c| c.to_string()).collect()
}

pub fn fallback_choices() -> Vec<String> {
    FALLBACK_CHOICES.iter().map(|c| c.to_string()).collect()
}

/// Parse enumerated lines (`1. ...`, `- ...`, `* ...`) out of `raw`.
///
/// Lines without a marker, or with nothing after it, are dropped. At most
/// `max_count` choices are returned, in line order; the result may be empty.
pub fn parse_choices(raw: &str, max_count: usize) -> Vec<String> {
    raw.lines()
        .filter_map(strip_marker)
        .take(max_count)
        .map(str::to_string)
        .collect()
}

/// The text after a leading enumeration marker, trimmed, if non-empty.
fn strip_marker(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '-' | '*' | '.'));

    if rest.len() == line.len() || !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let text = rest.trim();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_lines_with_blank_line() {
        let choices = parse_choices("1. Go north\n2. Go south\n\n3. Wait", 3);
        assert_eq!(choices, vec!["Go north", "Go south", "Wait"]);
    }

    #[test]
    fn test_no_numbered_lines() {
        assert!(parse_choices("Here are some ideas for you.\nGood luck!", 3).is_empty());
        assert!(parse_choices("", 3).is_empty());
    }

    #[test]
    fn test_marker_variants() {
        let raw = "  - 走進森林\n* 回到村莊\n10. 詢問老人\n1.) 不算\n-\n2.   \n3.沒有空白";
        assert_eq!(
            parse_choices(raw, 10),
            vec!["走進森林", "回到村莊", "詢問老人"]
        );
    }

    #[test]
    fn test_truncates_to_max_count() {
        let raw = "1. a\n2. b\n3. c\n4. d\n5. e";
        assert_eq!(parse_choices(raw, 3), vec!["a", "b", "c"]);
        assert_eq!(parse_choices(raw, 1), vec!["a"]);
    }

    #[test]
    fn test_preamble_is_skipped() {
        let raw = "以下是選項：\n1. 打開門\n2. 躲起來\n希望你喜歡";
        assert_eq!(parse_choices(raw, 3), vec!["打開門", "躲起來"]);
    }

    #[test]
    fn test_default_sets() {
        assert_eq!(default_choices().len(), 3);
        assert_eq!(fallback_choices()[0], "繼續探索");
    }
}
