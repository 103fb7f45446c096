//! Tuner capability and per-pass allocation state.

use pvr_types::{ChannelType, Program};
use serde::Deserialize;

/// A physical tuner as described in the configuration.
///
/// Stateless: allocation state lives in a [`TunerSlot`] that is rebuilt
/// from scratch on every allocator pass.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunerDevice {
    /// Display name (e.g. "PX-MLT1").
    pub name: String,
    /// Channel types the tuner can receive.
    pub types: Vec<ChannelType>,
    /// Tuner cannot be shared between programs, even on the same channel.
    #[serde(default)]
    pub exclusive: bool,
}

impl TunerDevice {
    pub fn new(name: impl Into<String>, types: Vec<ChannelType>) -> Self {
        Self {
            name: name.into(),
            types,
            exclusive: false,
        }
    }

    /// A tuner accepting every channel type.
    pub fn universal(name: impl Into<String>) -> Self {
        Self::new(
            name,
            vec![ChannelType::GR, ChannelType::BS, ChannelType::CS, ChannelType::SKY],
        )
    }

    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.types.contains(&channel_type)
    }
}

/// Key identifying what a tuner is tuned to.
///
/// Programs with the same key arrive on the same transport stream and can
/// share one tuner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub channel_type: ChannelType,
    pub channel: String,
}

impl ChannelKey {
    pub fn of(program: &Program) -> Self {
        Self {
            channel_type: program.channel_type,
            channel: program.channel.clone(),
        }
    }
}

/// Capacity state of one tuner during an allocator pass.
#[derive(Debug)]
pub struct TunerSlot<'a> {
    device: &'a TunerDevice,
    tuned: Option<ChannelKey>,
    programs: Vec<i64>,
}

impl<'a> TunerSlot<'a> {
    pub fn new(device: &'a TunerDevice) -> Self {
        Self {
            device,
            tuned: None,
            programs: Vec::new(),
        }
    }

    /// Try to place a program on this tuner. Returns whether it was accepted.
    pub fn try_add(&mut self, program: &Program) -> bool {
        if !self.device.supports(program.channel_type) {
            return false;
        }

        let key = ChannelKey::of(program);
        match &self.tuned {
            None => {
                self.tuned = Some(key);
                self.programs.push(program.id);
                true
            }
            Some(_) if self.device.exclusive => false,
            Some(current) if *current == key => {
                self.programs.push(program.id);
                true
            }
            Some(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.tuned = None;
        self.programs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn programs(&self) -> &[i64] {
        &self.programs
    }

    pub fn device(&self) -> &TunerDevice {
        self.device
    }
}
