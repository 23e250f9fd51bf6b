//! Address coverage for the memory test.

use rand::seq::{index, SliceRandom};
use rand::Rng;
use tracing::info;

use crate::error::{Error, Result};

/// Number of 16-bit cells addressable on the device.
pub const ADDRESS_SPACE: usize = 1 << 16;

/// Unique addresses in the order they are written and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveragePlan {
    addresses: Vec<u16>,
}

impl CoveragePlan {
    /// Builds a plan of `size` distinct addresses.
    ///
    /// The full space is used as-is when `size` covers it, otherwise a
    /// uniform sample without replacement is drawn. Either way the order is
    /// shuffled so writes never walk the address bus monotonically.
    pub fn new<R: Rng + ?Sized>(size: usize, rng: &mut R) -> Result<Self> {
        if size == 0 || size > ADDRESS_SPACE {
            return Err(Error::Config(format!(
                "coverage size must be between 1 and {}, got {}",
                ADDRESS_SPACE, size
            )));
        }

        let mut addresses: Vec<u16> = if size == ADDRESS_SPACE {
            info!("generating full 64K address list");
            (0..=u16::MAX).collect()
        } else {
            info!(size, "sampling unique addresses from 64K space");
            index::sample(rng, ADDRESS_SPACE, size)
                .into_iter()
                .map(|i| i as u16)
                .collect()
        };
        addresses.shuffle(rng);

        Ok(Self { addresses })
    }

    /// Uses a caller-chosen order, e.g. to replay a failing run.
    pub fn from_addresses(addresses: Vec<u16>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::Config(String::from("coverage plan is empty")));
        }
        let mut seen = vec![false; ADDRESS_SPACE];
        for &address in &addresses {
            if std::mem::replace(&mut seen[address as usize], true) {
                return Err(Error::Config(format!(
                    "address 0x{:04X} appears twice in coverage plan",
                    address
                )));
            }
        }
        Ok(Self { addresses })
    }

    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Progress is reported every 1% of the plan, at least every address.
    pub fn progress_step(&self) -> usize {
        (self.len() / 100).max(1)
    }
}
