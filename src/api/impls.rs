use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::bail;

use super::*;

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Active => "Active",
            Self::Approved => "Approved",
            Self::Closed => "Closed",
        };
        write!(f, "{}", output)
    }
}
impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Active" => Ok(Self::Active),
            "Approved" => Ok(Self::Approved),
            "Closed" => Ok(Self::Closed),
            e => bail!("Couldn't deserialize to Status: {}", e),
        }
    }
}
impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}
