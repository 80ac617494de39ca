//! The set of readable items and the order in which a poll cycle visits them.
//!
//! Items live in a single arena. Two index structures point into it:
//!
//! - the legacy lists, one per kind, read from the default slave with no
//!   transform (the flat `coils`/`inputs`/`registers`/`inputRegisters` objects);
//! - the per-slave groups, one ordered map per kind, keyed by slave address
//!   (the `values` entries).
//!
//! Both are read on every poll. An item added through both paths is read,
//! and reported, twice.

use crate::config::{ConfigError, RegisterMapConfig};
use fieldpoll_common::DatapointValue;
use std::collections::BTreeMap;

/// Modbus data kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    /// Read/write output bit
    Coil,
    /// Read-only input bit
    DiscreteInput,
    /// Read/write 16-bit register
    HoldingRegister,
    /// Read-only 16-bit register
    InputRegister,
}

impl RegisterKind {
    /// All kinds, in poll order.
    pub const ALL: [RegisterKind; 4] = [
        RegisterKind::Coil,
        RegisterKind::DiscreteInput,
        RegisterKind::HoldingRegister,
        RegisterKind::InputRegister,
    ];

    /// Return the configuration key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Coil => "coil",
            RegisterKind::DiscreteInput => "input",
            RegisterKind::HoldingRegister => "register",
            RegisterKind::InputRegister => "inputRegister",
        }
    }

    /// Whether the kind carries a single bit.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    fn index(self) -> usize {
        match self {
            RegisterKind::Coil => 0,
            RegisterKind::DiscreteInput => 1,
            RegisterKind::HoldingRegister => 2,
            RegisterKind::InputRegister => 3,
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear transform `offset + raw * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub scale: f64,
    pub offset: f64,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        scale: 1.0,
        offset: 0.0,
    };

    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    pub fn apply(&self, raw: u16) -> f64 {
        self.offset + f64::from(raw) * self.scale
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// One named, readable quantity. Immutable once added to a [`RegisterMap`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterItem {
    name: String,
    kind: RegisterKind,
    address: u16,
    slave: Option<u8>,
    transform: Transform,
}

impl RegisterItem {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    /// Zero-based address within the kind's address space.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Slave the item was registered under; `None` for legacy items, which
    /// are read from the session's default slave.
    pub fn slave(&self) -> Option<u8> {
        self.slave
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Convert a raw reading into the value reported for this item.
    ///
    /// Legacy items and per-slave coils report the raw value as an integer.
    /// Every other per-slave item reports `offset + raw * scale` as a float.
    pub fn decode(&self, raw: u16) -> DatapointValue {
        match self.slave {
            Some(_) if self.kind != RegisterKind::Coil => {
                DatapointValue::Float(self.transform.apply(raw))
            }
            _ => DatapointValue::from(raw),
        }
    }
}

/// Which slave a read group addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveSelector {
    /// The session's default slave, resolved at poll time.
    Default,
    Id(u8),
}

/// Items read back to back after a single slave selection.
#[derive(Debug, Clone)]
pub struct ReadGroup<'a> {
    pub slave: SlaveSelector,
    pub items: Vec<&'a RegisterItem>,
}

/// Register map with legacy and per-slave groupings over one item arena.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    items: Vec<RegisterItem>,
    legacy: [Vec<usize>; 4],
    slaves: [BTreeMap<u8, Vec<usize>>; 4],
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from its description. Entries without a `slave` go to
    /// `default_slave`'s group; flat objects go to the legacy lists.
    pub fn from_config(config: &RegisterMapConfig, default_slave: u8) -> Result<Self, ConfigError> {
        let mut map = Self::new();

        for entry in &config.values {
            let slave = entry.slave.unwrap_or(default_slave);
            let kinds = [
                (RegisterKind::Coil, entry.coil),
                (RegisterKind::DiscreteInput, entry.input),
                (RegisterKind::HoldingRegister, entry.register),
                (RegisterKind::InputRegister, entry.input_register),
            ];

            let mut added = false;
            for (kind, address) in kinds {
                if let Some(address) = address {
                    map.add(
                        kind,
                        slave,
                        &entry.name,
                        address,
                        entry.scale,
                        entry.offset,
                    );
                    added = true;
                }
            }

            if !added {
                return Err(ConfigError::Validation(format!(
                    "map entry '{}' needs one of coil, input, register or inputRegister",
                    entry.name
                )));
            }
        }

        let flat = [
            (RegisterKind::Coil, &config.coils),
            (RegisterKind::DiscreteInput, &config.inputs),
            (RegisterKind::HoldingRegister, &config.registers),
            (RegisterKind::InputRegister, &config.input_registers),
        ];
        for (kind, entries) in flat {
            for (name, address) in entries {
                map.add_legacy(kind, name, *address);
            }
        }

        Ok(map)
    }

    pub fn add_coil(&mut self, slave: u8, name: &str, address: u16, scale: f64, offset: f64) {
        self.add(RegisterKind::Coil, slave, name, address, scale, offset);
    }

    pub fn add_input(&mut self, slave: u8, name: &str, address: u16, scale: f64, offset: f64) {
        self.add(RegisterKind::DiscreteInput, slave, name, address, scale, offset);
    }

    pub fn add_register(&mut self, slave: u8, name: &str, address: u16, scale: f64, offset: f64) {
        self.add(
            RegisterKind::HoldingRegister,
            slave,
            name,
            address,
            scale,
            offset,
        );
    }

    pub fn add_input_register(
        &mut self,
        slave: u8,
        name: &str,
        address: u16,
        scale: f64,
        offset: f64,
    ) {
        self.add(
            RegisterKind::InputRegister,
            slave,
            name,
            address,
            scale,
            offset,
        );
    }

    pub fn add_legacy_coil(&mut self, name: &str, address: u16) {
        self.add_legacy(RegisterKind::Coil, name, address);
    }

    pub fn add_legacy_input(&mut self, name: &str, address: u16) {
        self.add_legacy(RegisterKind::DiscreteInput, name, address);
    }

    pub fn add_legacy_register(&mut self, name: &str, address: u16) {
        self.add_legacy(RegisterKind::HoldingRegister, name, address);
    }

    pub fn add_legacy_input_register(&mut self, name: &str, address: u16) {
        self.add_legacy(RegisterKind::InputRegister, name, address);
    }

    /// Append an item to `slave`'s group for `kind`. Duplicates are kept.
    pub fn add(
        &mut self,
        kind: RegisterKind,
        slave: u8,
        name: &str,
        address: u16,
        scale: f64,
        offset: f64,
    ) {
        let index = self.push(RegisterItem {
            name: name.to_string(),
            kind,
            address,
            slave: Some(slave),
            transform: Transform::new(scale, offset),
        });
        self.slaves[kind.index()]
            .entry(slave)
            .or_default()
            .push(index);
    }

    /// Append an item to the legacy default-slave list for `kind`.
    pub fn add_legacy(&mut self, kind: RegisterKind, name: &str, address: u16) {
        let index = self.push(RegisterItem {
            name: name.to_string(),
            kind,
            address,
            slave: None,
            transform: Transform::IDENTITY,
        });
        self.legacy[kind.index()].push(index);
    }

    fn push(&mut self, item: RegisterItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    /// Total number of items across both groupings.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items in insertion order.
    pub fn items(&self) -> impl Iterator<Item = &RegisterItem> {
        self.items.iter()
    }

    /// Legacy items of one kind, in insertion order.
    pub fn legacy_items(&self, kind: RegisterKind) -> impl Iterator<Item = &RegisterItem> {
        self.legacy[kind.index()].iter().map(|&i| &self.items[i])
    }

    /// Slaves with at least one item of `kind`, ascending.
    pub fn slaves(&self, kind: RegisterKind) -> impl Iterator<Item = u8> + '_ {
        self.slaves[kind.index()].keys().copied()
    }

    /// Items of `kind` registered under `slave`, in insertion order.
    pub fn slave_items(&self, kind: RegisterKind, slave: u8) -> impl Iterator<Item = &RegisterItem> {
        self.slaves[kind.index()]
            .get(&slave)
            .into_iter()
            .flatten()
            .map(|&i| &self.items[i])
    }

    /// The read sequence of one poll cycle.
    ///
    /// The first group is always the default slave with every legacy item
    /// (coils, inputs, registers, input registers). Then, kind by kind in
    /// the same order, one group per slave in ascending address order.
    pub fn read_plan(&self) -> Vec<ReadGroup<'_>> {
        let mut plan = Vec::with_capacity(1 + self.slaves.iter().map(BTreeMap::len).sum::<usize>());

        plan.push(ReadGroup {
            slave: SlaveSelector::Default,
            items: RegisterKind::ALL
                .iter()
                .flat_map(|&kind| self.legacy_items(kind))
                .collect(),
        });

        for kind in RegisterKind::ALL {
            for (&slave, indices) in &self.slaves[kind.index()] {
                plan.push(ReadGroup {
                    slave: SlaveSelector::Id(slave),
                    items: indices.iter().map(|&i| &self.items[i]).collect(),
                });
            }
        }

        plan
    }
}
