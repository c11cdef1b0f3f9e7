// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

const KIB_PER_UNIT: &[(&str, u64)] = &[
    ("k", 1),
    ("kib", 1),
    ("m", 1 << 10),
    ("mib", 1 << 10),
    ("g", 1 << 20),
    ("gib", 1 << 20),
    ("t", 1 << 30),
    ("tib", 1 << 30),
];

/// Parses a memory size into whole MiB.
///
/// A bare number is taken to be MiB. `K`, `M`, `G` and `T` suffixes (optionally
/// followed by `iB`, case-insensitive) scale a possibly fractional number.
/// Sizes that are not a whole number of MiB are rejected.
pub fn parse_size_mib(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    if number.is_empty() {
        return None;
    }

    let unit = unit.trim().to_ascii_lowercase();
    let factor = if unit.is_empty() {
        1 << 10
    } else {
        KIB_PER_UNIT.iter().find(|(name, _)| *name == unit)?.1
    };

    let kib = match number.split_once('.') {
        None => number.parse::<u64>().ok()?.checked_mul(factor)?,
        Some((whole, frac)) => {
            if frac.is_empty() || frac.len() > 6 {
                return None;
            }
            let scale = 10u64.pow(frac.len() as u32);
            let whole = if whole.is_empty() {
                0
            } else {
                whole.parse::<u64>().ok()?
            };
            let frac = frac.parse::<u64>().ok()?;
            let scaled = whole
                .checked_mul(scale)?
                .checked_add(frac)?
                .checked_mul(factor)?;
            if scaled % scale != 0 {
                return None;
            }
            scaled / scale
        }
    };

    if kib % 1024 != 0 {
        return None;
    }

    Some(kib / 1024)
}

#[cfg(test)]
mod test {
    use super::parse_size_mib;

    #[test]
    fn sizes() {
        const CASES: &[(&str, Option<u64>)] = &[
            ("1024", Some(1024)),
            ("512M", Some(512)),
            ("4G", Some(4096)),
            ("1.5G", Some(1536)),
            ("2GiB", Some(2048)),
            ("1048576K", Some(1024)),
            ("1T", Some(1 << 20)),
            ("512K", None),
            ("1.0000001G", None),
            ("", None),
            ("G", None),
            ("12Q", None),
            ("ten", None),
        ];

        for (input, expected) in CASES {
            assert_eq!(parse_size_mib(input), *expected, "parsing {input:?}");
        }
    }
}
