//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery, register codec and field transports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Conversion between 16-bit register pairs and IEEE-754 single precision
//! values. The high word always carries bits 31..16.

use indexmap::IndexMap;
use r_gw_common::RegisterPair;

/// Combine a register pair into a raw 32-bit word, high word first.
pub fn registers_to_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Reinterpret a register pair as an `f32`. Every bit pattern is accepted,
/// including NaN payloads and infinities.
pub fn registers_to_f32(high: u16, low: u16) -> f32 {
    f32::from_bits(registers_to_u32(high, low))
}

/// Split an `f32` into its `(high, low)` register pair.
pub fn f32_to_registers(value: f32) -> (u16, u16) {
    let bits = value.to_bits();
    ((bits >> 16) as u16, (bits & 0xFFFF) as u16)
}

/// Contiguous run of registers read from one device in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    /// Protocol address of the first register.
    pub start: u16,
    /// Raw register values in address order.
    pub values: Vec<u16>,
}

/// A parameter whose registers are not covered by the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfRangeParameter {
    /// Configured parameter name.
    pub parameter: String,
    /// Register numbers that were requested.
    pub registers: RegisterPair,
}

/// Result of decoding a block against a parameter map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBlock {
    /// Decoded values, in configured parameter order.
    pub values: IndexMap<String, f32>,
    /// Parameters that had to be omitted.
    pub out_of_range: Vec<OutOfRangeParameter>,
}

impl RegisterBlock {
    /// Create a block starting at `start`.
    pub fn new(start: u16, values: Vec<u16>) -> Self {
        Self { start, values }
    }

    /// Look up a register by its documented number, where `number_base` is
    /// the number of the register at protocol address 0 (30001 for input
    /// registers).
    pub fn register(&self, number: u16, number_base: u16) -> Option<u16> {
        let address = number.checked_sub(number_base)?;
        let index = address.checked_sub(self.start)?;
        self.values.get(usize::from(index)).copied()
    }

    /// Decode every configured parameter that lies inside the block.
    pub fn decode(
        &self,
        parameters: &IndexMap<String, RegisterPair>,
        number_base: u16,
    ) -> DecodedBlock {
        let mut decoded = DecodedBlock::default();
        for (name, pair) in parameters {
            match (
                self.register(pair.high, number_base),
                self.register(pair.low, number_base),
            ) {
                (Some(high), Some(low)) => {
                    decoded
                        .values
                        .insert(name.clone(), registers_to_f32(high, low));
                }
                _ => decoded.out_of_range.push(OutOfRangeParameter {
                    parameter: name.clone(),
                    registers: *pair,
                }),
            }
        }
        decoded
    }
}
