//! Human-readable duration strings ("30 segundos", "5 minutes", "1 hora").

pub const DEFAULT_COOLDOWN_SECS: u64 = 30;

const SECOND_UNITS: &[&str] = &["segundo", "second", "sec", "s"];
const MINUTE_UNITS: &[&str] = &["minuto", "minute", "min", "m"];
const HOUR_UNITS: &[&str] = &["hora", "hour", "h"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Seconds,
    Minutes,
    Hours,
}

impl Unit {
    fn factor(self) -> u64 {
        match self {
            Unit::Seconds => 1,
            Unit::Minutes => 60,
            Unit::Hours => 3_600,
        }
    }

    /// Amount used when the text names a unit but carries no number.
    fn bare_amount(self) -> u64 {
        match self {
            Unit::Seconds => DEFAULT_COOLDOWN_SECS,
            Unit::Minutes | Unit::Hours => 1,
        }
    }
}

/// Parse a cool-off duration into whole seconds.
///
/// Unrecognised text falls back to [`DEFAULT_COOLDOWN_SECS`]; so does an
/// amount too large to represent.
pub fn parse_duration_secs(text: &str) -> u64 {
    let lowered = text.trim().to_lowercase();

    let Some(unit) = detect_unit(&lowered) else {
        return DEFAULT_COOLDOWN_SECS;
    };

    let amount = match leading_digits(&lowered) {
        Some(digits) => match digits.parse::<u64>() {
            Ok(amount) => amount,
            Err(_) => return DEFAULT_COOLDOWN_SECS,
        },
        None => unit.bare_amount(),
    };
    amount
        .checked_mul(unit.factor())
        .unwrap_or(DEFAULT_COOLDOWN_SECS)
}

/// Parse the leading integer of a count string such as "3" or "5 aperturas".
pub fn parse_count(text: &str) -> Option<u32> {
    leading_digits(text.trim()).and_then(|digits| digits.parse().ok())
}

/// Countdown label: "M:SS" from one minute up, "Ns" below.
pub fn format_remaining(secs: u64) -> String {
    let mins = secs / 60;
    let rest = secs % 60;
    if mins > 0 {
        format!("{mins}:{rest:02}")
    } else {
        format!("{rest}s")
    }
}

fn detect_unit(text: &str) -> Option<Unit> {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| !word.is_empty())
        .collect();

    let matches = |units: &[&str]| {
        words
            .iter()
            .any(|word| units.iter().any(|unit| word.starts_with(unit) && unit_fits(word, unit)))
    };

    if matches(SECOND_UNITS) {
        Some(Unit::Seconds)
    } else if matches(MINUTE_UNITS) {
        Some(Unit::Minutes)
    } else if matches(HOUR_UNITS) {
        Some(Unit::Hours)
    } else {
        None
    }
}

/// Single-letter abbreviations only match on their own ("5 s", "10m"),
/// never as the first letter of an unrelated word.
fn unit_fits(word: &str, unit: &str) -> bool {
    unit.len() > 1 || word.len() == 1
}

fn leading_digits(text: &str) -> Option<String> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    (!digits.is_empty()).then_some(digits)
}
