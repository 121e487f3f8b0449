//! Credit amounts
//!
//! Usage is accounted in credits. The ledger stores hundredths of a credit
//! ("credit cents") as a signed integer so that sums stay exact.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg};

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CreditCents(i64);

impl CreditCents {
    pub const ZERO: CreditCents = CreditCents(0);

    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn from_credits(credits: i64) -> Self {
        Self(credits * 100)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }

    pub fn to_credits(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Whole credits, rounded towards positive infinity.
    ///
    /// The processor only accepts integral quantities; partial credits are
    /// always billed as a full one.
    pub const fn ceil_credits(&self) -> i64 {
        let whole = self.0.div_euclid(100);
        if self.0.rem_euclid(100) > 0 {
            whole + 1
        } else {
            whole
        }
    }
}

impl fmt::Display for CreditCents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.to_credits())
    }
}

impl Add for CreditCents {
    type Output = CreditCents;

    fn add(self, rhs: Self) -> Self::Output {
        CreditCents(self.0 + rhs.0)
    }
}

impl AddAssign for CreditCents {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Neg for CreditCents {
    type Output = CreditCents;

    fn neg(self) -> Self::Output {
        CreditCents(-self.0)
    }
}

impl Sum for CreditCents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(CreditCents::ZERO, Add::add)
    }
}
