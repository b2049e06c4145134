//! Repair of broken RSP timestamps.
//!
//! Some RSP firmware revisions stamp frames with a `(unix_time,
//! sample_number)` pair that is off by a fixed amount around second
//! boundaries in 200 MHz mode. The known fixes are expressed as data: a
//! [`CorrectionProfile`] is an ordered rule list, the first rule matching a
//! frame is applied. Profiles can be replaced from the config file, so a new
//! firmware quirk is a config change rather than a code change.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::header::FrameHeader;

/// Which correction profile a session applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixLevel {
    None,
    /// Old-style fix for early firmware (fix level 1).
    Legacy,
    /// New-style fix (fix level 2).
    #[default]
    Modern,
}

impl FixLevel {
    /// Numeric level used on the command line: 0, 1 or 2.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(FixLevel::None),
            1 => Some(FixLevel::Legacy),
            2 => Some(FixLevel::Modern),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            FixLevel::None => 0,
            FixLevel::Legacy => 1,
            FixLevel::Modern => 2,
        }
    }
}

/// Parity of the `unix_time` second a rule applies to. Parity is that of
/// the signed value, so -1 is odd and -2 is even.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondParity {
    #[default]
    Any,
    Odd,
    Even,
}

impl SecondParity {
    fn matches(self, unix_time: i32) -> bool {
        match self {
            SecondParity::Any => true,
            SecondParity::Odd => unix_time.rem_euclid(2) == 1,
            SecondParity::Even => unix_time.rem_euclid(2) == 0,
        }
    }
}

/// One correction: a match condition and the shifts applied on a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRule {
    pub frequency_code: u8,
    #[serde(default)]
    pub parity: SecondParity,
    /// Only match frames carrying exactly this sample number.
    #[serde(default)]
    pub sample_number: Option<u32>,
    /// Only match while the carry flag (set by an earlier rule) is raised.
    #[serde(default)]
    pub requires_carry: bool,
    #[serde(default)]
    pub time_shift: i32,
    #[serde(default)]
    pub sample_shift: u32,
    /// New value of the carry flag after a match; `None` leaves it alone.
    #[serde(default)]
    pub set_carry: Option<bool>,
}

impl CorrectionRule {
    fn new(frequency_code: u8, parity: SecondParity) -> Self {
        Self {
            frequency_code,
            parity,
            sample_number: None,
            requires_carry: false,
            time_shift: 0,
            sample_shift: 0,
            set_carry: None,
        }
    }

    fn matches(&self, header: &FrameHeader, carry: bool) -> bool {
        self.frequency_code == header.sample_frequency_code
            && self.parity.matches(header.unix_time)
            && self.sample_number.map_or(true, |n| n == header.sample_number)
            && (!self.requires_carry || carry)
    }
}

/// Ordered correction rules plus the frequency codes the profile knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionProfile {
    pub frequency_codes: Vec<u8>,
    #[serde(default)]
    pub rules: Vec<CorrectionRule>,
}

impl CorrectionProfile {
    /// Fix for old firmware: the last frame of a second carries the next
    /// second's time stamp, and odd seconds are 512 samples short.
    pub fn legacy() -> Self {
        Self {
            frequency_codes: vec![160, 200],
            rules: vec![
                CorrectionRule {
                    sample_number: Some(199_999_488),
                    time_shift: -1,
                    ..CorrectionRule::new(200, SecondParity::Odd)
                },
                CorrectionRule {
                    sample_shift: 512,
                    set_carry: Some(true),
                    ..CorrectionRule::new(200, SecondParity::Odd)
                },
                CorrectionRule {
                    sample_number: Some(199_998_464),
                    requires_carry: true,
                    time_shift: -1,
                    sample_shift: 512,
                    ..CorrectionRule::new(200, SecondParity::Even)
                },
                CorrectionRule {
                    set_carry: Some(false),
                    ..CorrectionRule::new(200, SecondParity::Even)
                },
                CorrectionRule {
                    sample_number: Some(159_998_976),
                    time_shift: -1,
                    ..CorrectionRule::new(160, SecondParity::Any)
                },
            ],
        }
    }

    /// Fix for current firmware: even seconds in 200 MHz mode are 512
    /// samples short.
    pub fn modern() -> Self {
        Self {
            frequency_codes: vec![160, 200],
            rules: vec![CorrectionRule {
                sample_shift: 512,
                ..CorrectionRule::new(200, SecondParity::Even)
            }],
        }
    }
}

/// Timestamp pair after correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectedTime {
    pub unix_time: i32,
    pub sample_number: u32,
}

/// Applies one correction profile to a stream of frames.
///
/// The only state is the carry flag some legacy rules use to remember that
/// the previous odd second was shifted; it lives for one session.
#[derive(Debug)]
pub struct TimestampCorrector {
    profile: Option<CorrectionProfile>,
    carry: bool,
    warned_codes: HashSet<u8>,
}

impl TimestampCorrector {
    pub fn new(profile: Option<CorrectionProfile>) -> Self {
        Self { profile, carry: false, warned_codes: HashSet::new() }
    }

    pub fn for_level(level: FixLevel) -> Self {
        Self::new(match level {
            FixLevel::None => None,
            FixLevel::Legacy => Some(CorrectionProfile::legacy()),
            FixLevel::Modern => Some(CorrectionProfile::modern()),
        })
    }

    /// Corrected `(unix_time, sample_number)` for `header`.
    pub fn correct(&mut self, header: &FrameHeader) -> CorrectedTime {
        let mut out = CorrectedTime {
            unix_time: header.unix_time,
            sample_number: header.sample_number,
        };
        let Some(profile) = &self.profile else {
            return out;
        };

        if !profile.frequency_codes.contains(&header.sample_frequency_code) {
            if self.warned_codes.insert(header.sample_frequency_code) {
                tracing::warn!(
                    code = header.sample_frequency_code,
                    "unsupported sample rate, time stamps left uncorrected"
                );
            }
            return out;
        }

        if let Some(rule) = profile.rules.iter().find(|r| r.matches(header, self.carry)) {
            out.unix_time = out.unix_time.wrapping_add(rule.time_shift);
            out.sample_number = out.sample_number.wrapping_add(rule.sample_shift);
            if let Some(c) = rule.set_carry {
                self.carry = c;
            }
        }
        out
    }

    /// Overwrite the header's time fields with their corrected values.
    pub fn apply(&mut self, header: &mut FrameHeader) {
        let fixed = self.correct(header);
        header.unix_time = fixed.unix_time;
        header.sample_number = fixed.sample_number;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
