use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// States covered by the social audit findings report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    AndhraPradesh,
    Assam,
    Bihar,
    Chhattisgarh,
    Gujarat,
    Jharkhand,
    Karnataka,
    Kerala,
    MadhyaPradesh,
    Maharashtra,
    Meghalaya,
    Odisha,
    Rajasthan,
    TamilNadu,
    Telangana,
    UttarPradesh,
}

impl State {
    /// Static reference list, in enumeration order.
    pub const ALL: [State; 16] = [
        State::AndhraPradesh,
        State::Assam,
        State::Bihar,
        State::Chhattisgarh,
        State::Gujarat,
        State::Jharkhand,
        State::Karnataka,
        State::Kerala,
        State::MadhyaPradesh,
        State::Maharashtra,
        State::Meghalaya,
        State::Odisha,
        State::Rajasthan,
        State::TamilNadu,
        State::Telangana,
        State::UttarPradesh,
    ];

    /// Upstream display name, as used in the report's `state_name` parameter.
    pub fn name(self) -> &'static str {
        match self {
            State::AndhraPradesh => "ANDHRA PRADESH",
            State::Assam => "ASSAM",
            State::Bihar => "BIHAR",
            State::Chhattisgarh => "CHHATTISGARH",
            State::Gujarat => "GUJARAT",
            State::Jharkhand => "JHARKHAND",
            State::Karnataka => "KARNATAKA",
            State::Kerala => "KERALA",
            State::MadhyaPradesh => "MADHYA PRADESH",
            State::Maharashtra => "MAHARASHTRA",
            State::Meghalaya => "MEGHALAYA",
            State::Odisha => "ODISHA",
            State::Rajasthan => "RAJASTHAN",
            State::TamilNadu => "TAMIL NADU",
            State::Telangana => "TELANGANA",
            State::UttarPradesh => "UTTAR PRADESH",
        }
    }

    /// Two-digit NREGA state code.
    pub fn code(self) -> &'static str {
        match self {
            State::AndhraPradesh => "02",
            State::Assam => "04",
            State::Bihar => "05",
            State::Chhattisgarh => "33",
            State::Gujarat => "11",
            State::Jharkhand => "34",
            State::Karnataka => "15",
            State::Kerala => "16",
            State::MadhyaPradesh => "17",
            State::Maharashtra => "18",
            State::Meghalaya => "21",
            State::Odisha => "24",
            State::Rajasthan => "27",
            State::TamilNadu => "29",
            State::Telangana => "36",
            State::UttarPradesh => "31",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown state: {0:?} (expected a state name such as \"TAMIL NADU\" or a state code such as \"29\")")]
pub struct UnknownState(pub String);

impl FromStr for State {
    type Err = UnknownState;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_state_name(input);
        State::ALL
            .into_iter()
            .find(|state| normalize_state_name(state.name()) == wanted || state.code() == wanted)
            .ok_or_else(|| UnknownState(input.to_owned()))
    }
}

fn normalize_state_name(input: &str) -> String {
    input
        .trim()
        .chars()
        .map(|c| match c {
            '_' | '-' => ' ',
            c => c.to_ascii_uppercase(),
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One unit of scraping work: a GP (or other administrative unit) in one audit year.
///
/// Ordering is (state, unit, year), which is also the order the driver
/// processes keys in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub state: State,
    pub unit: String,
    pub year: u16,
}

impl Key {
    pub fn new(state: State, unit: impl Into<String>, year: u16) -> Self {
        Self {
            state,
            unit: unit.into(),
            year,
        }
    }

    pub fn audit_year(&self) -> String {
        audit_year_label(self.year)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.state, self.unit, self.year)
    }
}

/// Administrative names for a unit, as the listing page labels them.
///
/// Carried into the output only; keys are identified by code alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Place {
    pub district: Option<String>,
    pub block: Option<String>,
    pub panchayat: Option<String>,
}

/// Upstream label for an audit year, e.g. `2015` -> `"2015-2016"`.
pub fn audit_year_label(year: u16) -> String {
    format!("{year}-{}", year.saturating_add(1))
}

/// What a single fetch addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// State-level page listing the GP units audited in a year.
    Listing { state: State, year: u16 },
    GpYear(Key),
    /// One gram sabha's findings when a GP-year held several.
    GramSabha { key: Key, date: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Listing { state, year } => write!(f, "listing {state}/{year}"),
            Target::GpYear(key) => write!(f, "{key}"),
            Target::GramSabha { key, date } => write!(f, "{key} (gram sabha {date})"),
        }
    }
}
