// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

use crate::base::{DecodeValue, EncodeValue};
use crate::error::{DecodeError, EncodeError};
use crate::reader::Reader;
use crate::writer::Writer;

/// Abstract unit of work credit consumed by server-side operations.
///
/// On the wire energy is a one-field product `{ quanta: u64 }`.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub struct EnergyQuanta {
    quanta: u64,
}

impl EnergyQuanta {
    /// Wrap a quanta count.
    #[must_use]
    pub const fn new(quanta: u64) -> Self {
        Self { quanta }
    }

    /// Zero energy.
    #[must_use]
    pub const fn zero() -> Self {
        Self { quanta: 0 }
    }

    /// Quanta count.
    #[must_use]
    pub const fn quanta(&self) -> u64 {
        self.quanta
    }

    /// Returns true if at least `cost` quanta are available.
    #[must_use]
    pub const fn can_afford(&self, cost: u64) -> bool {
        self.quanta >= cost
    }
}

impl fmt::Display for EnergyQuanta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EnergyQuanta({})", self.quanta)
    }
}

impl Add for EnergyQuanta {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            quanta: self.quanta.saturating_add(rhs.quanta),
        }
    }
}

impl Sub for EnergyQuanta {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            quanta: self.quanta.saturating_sub(rhs.quanta),
        }
    }
}

impl EncodeValue for EnergyQuanta {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_product_header(1)?;
        writer.write_field_name("quanta")?;
        writer.write_u64(self.quanta)
    }
}

impl DecodeValue for EnergyQuanta {
    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let field_count = reader.read_product_header()?;
        let mut quanta = 0;
        for _ in 0..field_count {
            let name = reader.read_field_name()?;
            if name == "quanta" {
                quanta = reader.read_u64()?;
            } else {
                // Unknown fields are tolerated for forward compatibility.
                log::trace!("Skip unknown energy field: {name}");
                reader.skip_value()?;
            }
        }
        Ok(Self { quanta })
    }
}
