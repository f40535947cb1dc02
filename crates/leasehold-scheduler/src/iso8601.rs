//! ISO-8601 durations (`P1DT2H`, `PT3M`, `PT0.5S`) as used in schedule
//! settings and config files.
//!
//! Calendar units are fixed-length: a year is 365 days and a month is 30
//! days. Parsing accepts `PnYnMnWnDTnHnMnS` with optional fractions on any
//! component; formatting emits the canonical `PnDTnHnMnS` subset so that
//! equivalent durations serialize identically.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;
const SECS_PER_MINUTE: u128 = 60;
const SECS_PER_HOUR: u128 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u128 = 24 * SECS_PER_HOUR;

/// Date-part designators in required order, with their length in seconds.
const DATE_UNITS: [(char, u128); 4] = [
    ('Y', 365 * SECS_PER_DAY),
    ('M', 30 * SECS_PER_DAY),
    ('W', 7 * SECS_PER_DAY),
    ('D', SECS_PER_DAY),
];
const TIME_UNITS: [(char, u128); 3] = [('H', SECS_PER_HOUR), ('M', SECS_PER_MINUTE), ('S', 1)];

/// Parse an ISO-8601 duration string.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let body = s
        .strip_prefix('P')
        .ok_or_else(|| format!("duration must start with 'P': {input:?}"))?;

    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => {
            if t.is_empty() {
                return Err(format!("empty time section after 'T': {input:?}"));
            }
            (d, Some(t))
        }
        None => (body, None),
    };

    let mut nanos = parse_section(date_part, &DATE_UNITS, input)?;
    if let Some(t) = time_part {
        nanos += parse_section(t, &TIME_UNITS, input)?;
    }

    if date_part.is_empty() && time_part.is_none() {
        return Err(format!("duration has no components: {input:?}"));
    }

    let secs = u64::try_from(nanos / NANOS_PER_SEC)
        .map_err(|_| format!("duration out of range: {input:?}"))?;
    Ok(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
}

/// Walk one section (`1Y2M` or `3H4M5S`), enforcing designator order.
fn parse_section(section: &str, units: &[(char, u128)], input: &str) -> Result<u128, String> {
    let mut total: u128 = 0;
    let mut next_unit = 0;
    let mut number = String::new();

    for c in section.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
            continue;
        }
        let pos = units[next_unit..]
            .iter()
            .position(|(u, _)| *u == c)
            .map(|p| p + next_unit)
            .ok_or_else(|| format!("unexpected designator '{c}' in {input:?}"))?;
        if number.is_empty() {
            return Err(format!("designator '{c}' without a value in {input:?}"));
        }
        total += scale(&number, units[pos].1, input)?;
        number.clear();
        next_unit = pos + 1;
    }

    if !number.is_empty() {
        return Err(format!("trailing number without designator in {input:?}"));
    }
    Ok(total)
}

/// `value` (possibly fractional) times `unit_secs`, in nanoseconds.
fn scale(value: &str, unit_secs: u128, input: &str) -> Result<u128, String> {
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(format!("malformed number in {input:?}"));
    }
    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| format!("malformed number in {input:?}"))?
    };
    let unit_nanos = unit_secs * NANOS_PER_SEC;
    let mut nanos = whole
        .checked_mul(unit_nanos)
        .ok_or_else(|| format!("duration out of range: {input:?}"))?;

    // Nine fractional digits are enough for nanosecond precision on seconds.
    let frac: String = frac.chars().take(9).collect();
    if !frac.is_empty() {
        let digits: u128 = frac
            .parse()
            .map_err(|_| format!("malformed fraction in {input:?}"))?;
        nanos += digits * unit_nanos / 10u128.pow(frac.len() as u32);
    }
    Ok(nanos)
}

/// Canonical ISO-8601 rendering: days, hours, minutes, seconds; zero is `PT0S`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs() as u128;
    let millis = d.subsec_millis();
    if total == 0 && millis == 0 {
        return "PT0S".to_string();
    }

    let days = total / SECS_PER_DAY;
    let hours = (total % SECS_PER_DAY) / SECS_PER_HOUR;
    let minutes = (total % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let seconds = total % SECS_PER_MINUTE;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || seconds > 0 || millis > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if millis > 0 {
            let frac = format!("{millis:03}");
            out.push_str(&format!("{seconds}.{}S", frac.trim_end_matches('0')));
        } else if seconds > 0 {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}
