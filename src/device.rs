//! The device model interface seen by the exit handlers.
//!
//! Exit handlers only ever talk to a [`DeviceBus`]. [`DeviceManager`] is the bus the monitor
//! ships with: it routes port and MMIO accesses to [`BusDevice`]s registered on
//! non-overlapping ranges.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::addr::{AccessDirection, AccessWidth, GuestPhysAddr, Port};
use crate::error::DeviceError;

/// The address of one device access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusAddress {
    Pio(Port),
    Mmio(GuestPhysAddr),
}

impl BusAddress {
    /// The address space name, for diagnostics.
    pub const fn space(&self) -> &'static str {
        match self {
            Self::Pio(_) => "pio",
            Self::Mmio(_) => "mmio",
        }
    }

    /// The raw address.
    pub fn raw(&self) -> u64 {
        match self {
            Self::Pio(port) => u64::from(*port),
            Self::Mmio(gpa) => gpa.as_usize() as u64,
        }
    }
}

/// Result of one device access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessStatus {
    Ok,
    /// No device claims the address.
    NoDevice,
    /// The device claims the address but refused the access.
    Failed(String),
}

/// The opaque saved state of one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub data: Vec<u8>,
}

/// Port and MMIO dispatch to device models.
///
/// Accesses may arrive concurrently from any vCPU thread; implementations serialize
/// internally.
pub trait DeviceBus: Send + Sync {
    /// Performs one access. `data` is exactly `width.size()` bytes, little-endian. For reads
    /// the device fills it; for writes it holds the value written.
    fn access(
        &self,
        addr: BusAddress,
        width: AccessWidth,
        direction: AccessDirection,
        data: &mut [u8],
    ) -> AccessStatus;

    /// Saves the state of every device. Only called while all vCPUs are quiesced.
    fn save_state(&self) -> Result<Vec<DeviceSnapshot>, DeviceError>;

    /// Restores state produced by [`DeviceBus::save_state`].
    fn restore_state(&self, states: &[DeviceSnapshot]) -> Result<(), DeviceError>;
}

/// A device model that can be mapped on the [`DeviceManager`].
///
/// Offsets are relative to the base of the range the device was registered on.
pub trait BusDevice: Send + Sync {
    /// A name unique among the devices of one machine.
    fn name(&self) -> &str;

    fn read(&self, offset: u64, data: &mut [u8]) -> Result<(), String>;

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), String>;

    /// The device's opaque state. Devices without state keep the default.
    fn save_state(&self) -> Result<Vec<u8>, String> {
        Ok(Vec::new())
    }

    fn restore_state(&self, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

struct Mapping {
    len: u64,
    device: Arc<dyn BusDevice>,
}

#[derive(Default)]
struct RangeMap {
    ranges: BTreeMap<u64, Mapping>,
}

impl RangeMap {
    fn insert(&mut self, base: u64, len: u64, device: Arc<dyn BusDevice>) -> Result<(), DeviceError> {
        let end = base.checked_add(len).filter(|_| len > 0);
        let overlap = match end {
            None => Some("<invalid range>".to_owned()),
            Some(end) => self
                .ranges
                .range(..end)
                .next_back()
                .filter(|(b, m)| **b + m.len > base)
                .map(|(_, m)| m.device.name().to_owned()),
        };
        if let Some(existing) = overlap {
            return Err(DeviceError::Overlap {
                base,
                len,
                existing,
            });
        }
        self.ranges.insert(base, Mapping { len, device });
        Ok(())
    }

    /// The device covering `[addr, addr + size)` entirely, with the offset into its range.
    fn find(&self, addr: u64, size: u64) -> Option<(&Arc<dyn BusDevice>, u64)> {
        let (base, mapping) = self.ranges.range(..=addr).next_back()?;
        let offset = addr - base;
        (offset + size <= mapping.len).then_some((&mapping.device, offset))
    }
}

/// A [`DeviceBus`] routing accesses by address range.
#[derive(Default)]
pub struct DeviceManager {
    pio: RwLock<RangeMap>,
    mmio: RwLock<RangeMap>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `device` on ports `[base, base + len)`.
    pub fn register_pio(
        &self,
        base: Port,
        len: u16,
        device: Arc<dyn BusDevice>,
    ) -> Result<(), DeviceError> {
        debug!("mapping {} on ports {base:#x}+{len:#x}", device.name());
        self.pio
            .write()
            .insert(u64::from(base), u64::from(len), device)
    }

    /// Maps `device` on guest-physical `[base, base + len)`.
    pub fn register_mmio(
        &self,
        base: GuestPhysAddr,
        len: u64,
        device: Arc<dyn BusDevice>,
    ) -> Result<(), DeviceError> {
        debug!("mapping {} on {base:?}+{len:#x}", device.name());
        self.mmio
            .write()
            .insert(base.as_usize() as u64, len, device)
    }

    /// Every mapped device, once, ordered by name.
    fn devices(&self) -> BTreeMap<String, Arc<dyn BusDevice>> {
        let mut devices = BTreeMap::new();
        for map in [&self.pio, &self.mmio] {
            for mapping in map.read().ranges.values() {
                devices
                    .entry(mapping.device.name().to_owned())
                    .or_insert_with(|| mapping.device.clone());
            }
        }
        devices
    }
}

impl DeviceBus for DeviceManager {
    fn access(
        &self,
        addr: BusAddress,
        width: AccessWidth,
        direction: AccessDirection,
        data: &mut [u8],
    ) -> AccessStatus {
        let map = match addr {
            BusAddress::Pio(_) => self.pio.read(),
            BusAddress::Mmio(_) => self.mmio.read(),
        };
        let Some((device, offset)) = map.find(addr.raw(), width.size() as u64) else {
            return AccessStatus::NoDevice;
        };
        trace!(
            "{} {direction:?} {:#x} -> {}+{offset:#x}",
            addr.space(),
            addr.raw(),
            device.name()
        );
        let result = match direction {
            AccessDirection::Read => device.read(offset, data),
            AccessDirection::Write => device.write(offset, data),
        };
        match result {
            Ok(()) => AccessStatus::Ok,
            Err(reason) => AccessStatus::Failed(reason),
        }
    }

    fn save_state(&self) -> Result<Vec<DeviceSnapshot>, DeviceError> {
        let mut states = Vec::new();
        for (name, device) in self.devices() {
            let data = device
                .save_state()
                .map_err(|reason| DeviceError::State {
                    name: name.clone(),
                    reason,
                })?;
            states.push(DeviceSnapshot { data, name });
        }
        Ok(states)
    }

    fn restore_state(&self, states: &[DeviceSnapshot]) -> Result<(), DeviceError> {
        let devices = self.devices();
        for state in states {
            let device = devices
                .get(&state.name)
                .ok_or_else(|| DeviceError::Unknown(state.name.clone()))?;
            device
                .restore_state(&state.data)
                .map_err(|reason| DeviceError::State {
                    name: state.name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Scratch {
        name: &'static str,
        regs: Mutex<[u8; 8]>,
    }

    impl Scratch {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                regs: Mutex::new([0; 8]),
            })
        }
    }

    impl BusDevice for Scratch {
        fn name(&self) -> &str {
            self.name
        }

        fn read(&self, offset: u64, data: &mut [u8]) -> Result<(), String> {
            let regs = self.regs.lock();
            let offset = offset as usize;
            data.copy_from_slice(&regs[offset..offset + data.len()]);
            Ok(())
        }

        fn write(&self, offset: u64, data: &[u8]) -> Result<(), String> {
            let mut regs = self.regs.lock();
            let offset = offset as usize;
            regs[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn save_state(&self) -> Result<Vec<u8>, String> {
            Ok(self.regs.lock().to_vec())
        }

        fn restore_state(&self, data: &[u8]) -> Result<(), String> {
            let regs: [u8; 8] = data
                .try_into()
                .map_err(|_| format!("expected 8 bytes, got {}", data.len()))?;
            *self.regs.lock() = regs;
            Ok(())
        }
    }

    #[test]
    fn routes_by_range() {
        let bus = DeviceManager::new();
        bus.register_pio(0x70, 2, Scratch::new("rtc")).unwrap();
        bus.register_mmio(GuestPhysAddr::from_usize(0xfed0_0000), 8, Scratch::new("hpet"))
            .unwrap();

        let mut data = [0x5a];
        assert_eq!(
            bus.access(BusAddress::Pio(0x71), AccessWidth::Byte, AccessDirection::Write, &mut data),
            AccessStatus::Ok
        );
        let mut data = [0];
        bus.access(BusAddress::Pio(0x71), AccessWidth::Byte, AccessDirection::Read, &mut data);
        assert_eq!(data, [0x5a]);

        // Straddles the end of the range.
        let mut data = [0; 2];
        assert_eq!(
            bus.access(BusAddress::Pio(0x71), AccessWidth::Word, AccessDirection::Read, &mut data),
            AccessStatus::NoDevice
        );
        let mut data = [0; 4];
        assert_eq!(
            bus.access(
                BusAddress::Mmio(GuestPhysAddr::from_usize(0xfed0_0004)),
                AccessWidth::Dword,
                AccessDirection::Read,
                &mut data
            ),
            AccessStatus::Ok
        );
        assert_eq!(
            bus.access(BusAddress::Pio(0x3f8), AccessWidth::Byte, AccessDirection::Read, &mut [0]),
            AccessStatus::NoDevice
        );
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let bus = DeviceManager::new();
        bus.register_pio(0x3f8, 8, Scratch::new("com1")).unwrap();
        let err = bus.register_pio(0x3fc, 8, Scratch::new("com1b")).unwrap_err();
        assert!(matches!(err, DeviceError::Overlap { existing, .. } if existing == "com1"));
        bus.register_pio(0x400, 1, Scratch::new("post")).unwrap();
        assert!(bus.register_pio(0x3f0, 0, Scratch::new("empty")).is_err());
    }

    #[test]
    fn state_round_trips_by_name() {
        let bus = DeviceManager::new();
        let rtc = Scratch::new("rtc");
        bus.register_pio(0x70, 2, rtc.clone()).unwrap();
        rtc.regs.lock()[1] = 7;
        let saved = bus.save_state().unwrap();
        rtc.regs.lock()[1] = 0;
        bus.restore_state(&saved).unwrap();
        assert_eq!(rtc.regs.lock()[1], 7);

        let bogus = [DeviceSnapshot {
            name: "missing".into(),
            data: vec![],
        }];
        assert!(matches!(bus.restore_state(&bogus), Err(DeviceError::Unknown(_))));

        let truncated = [DeviceSnapshot {
            name: "rtc".into(),
            data: vec![1, 2, 3],
        }];
        assert!(matches!(
            bus.restore_state(&truncated),
            Err(DeviceError::State { name, .. }) if name == "rtc"
        ));
        assert_eq!(rtc.regs.lock()[1], 7);
    }
}
