//! # quill-bus
//!
//! PCI/PCIe bus address allocation for generated machine descriptions.
//!
//! QEMU expects every cold-plugged device to carry an explicit bus address
//! so the guest-visible topology stays stable across restarts. The
//! allocator runs once per machine-description build, before the
//! hypervisor process exists, and hands out slot/function pairs. Devices
//! that name the same group share one physical slot the way real
//! multifunction PCI cards do; on PCIe machines each slot sits behind its
//! own `pcie-root-port` device, which the allocator also declares.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;

/// The root bus name used by flat-PCI machine types.
const ROOT_BUS: &str = "pci.0";

/// Bus flavour of the target machine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// Flat PCI: devices are addressed directly on the root bus.
    Pci,
    /// PCIe: each multifunction slot sits behind its own root port.
    Pcie,
    /// s390x channel I/O: devices carry no bus address at all.
    Ccw,
}

/// An allocated location on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciSlot {
    /// Bus the device attaches to (`pci.0`, or a root-port name on PCIe).
    pub bus: String,
    /// `device.function` address string, as the machine description wants it.
    pub addr: String,
    /// Whether the device must declare itself multifunction.
    pub multifunction: bool,
}

/// A `pcie-root-port` device the allocator decided the machine needs.
///
/// Emitted once per slot; the generator declares these alongside the
/// devices whose addresses refer to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPortDevice {
    /// Device id, also the bus name child devices attach to.
    pub name: String,
    /// Sequential port index (doubles as the chassis number).
    pub index: u32,
    /// Device number of the port itself on the root bus.
    pub device: u32,
    /// Function number of the port itself on the root bus, 0-7.
    pub function: u32,
}

impl RootPortDevice {
    /// The port's own address on the root bus.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{:x}.{}", self.device, self.function)
    }

    /// A port at function 0 opens a multifunction slot on the root bus.
    #[must_use]
    pub const fn multifunction(&self) -> bool {
        self.function == 0
    }
}

/// One multifunction slot handing out functions 0-7.
#[derive(Debug, Default, Clone)]
struct BusEntry {
    /// Device number on the parent bridge.
    bridge_device: u32,
    /// Function number on the parent bridge (meaningful for root ports).
    bridge_function: u32,
    /// Root-port name assigned when the slot's function 0 was allocated.
    port_name: Option<String>,
    /// Function number handed out by the current allocation, 0-7.
    function: u32,
}

/// Tracks the root-bus slot the next root port lands in.
#[derive(Debug, Clone, Copy)]
struct RootSlot {
    device: u32,
    function: u32,
}

/// Per-machine bus address allocator.
///
/// Built once per machine-description generation and discarded with it.
/// Not synchronized: description generation is single-threaded, and the
/// allocator must not be shared across concurrent builds.
#[derive(Debug)]
pub struct BusAllocator {
    kind: BusKind,
    next_port: u32,
    next_device: u32,
    root_port: Option<RootSlot>,
    groups: HashMap<String, BusEntry>,
    root_ports: Vec<RootPortDevice>,
}

impl BusAllocator {
    /// Creates an allocator for the given bus kind.
    ///
    /// Device numbering starts at 1; device 0 on the root bus belongs to
    /// the memory controller.
    #[must_use]
    pub fn new(kind: BusKind) -> Self {
        Self {
            kind,
            next_port: 0,
            next_device: 1,
            root_port: None,
            groups: HashMap::new(),
            root_ports: Vec::new(),
        }
    }

    /// The bus kind this allocator serves.
    #[must_use]
    pub const fn kind(&self) -> BusKind {
        self.kind
    }

    /// Root-port devices emitted so far, in declaration order.
    #[must_use]
    pub fn root_ports(&self) -> &[RootPortDevice] {
        &self.root_ports
    }

    /// Allocates a bus address.
    ///
    /// `group: Some(key)` packs cooperating devices into one slot: the
    /// first allocation of a group takes function 0 and reports itself
    /// multifunction, the next seven take functions 1-7, and the ninth
    /// rolls the group over to a fresh slot. `group: None` takes a
    /// one-shot anonymous slot that is never reported multifunction.
    ///
    /// Returns `None` on channel-I/O machines, which have no bus
    /// addressing; callers omit the address attributes entirely.
    pub fn allocate(&mut self, group: Option<&str>) -> Option<PciSlot> {
        if self.kind == BusKind::Ccw {
            return None;
        }

        let mut entry = match group.and_then(|key| self.groups.get(key).cloned()) {
            Some(mut entry) => {
                if entry.function == 7 {
                    // Slot exhausted; the group continues in a fresh one.
                    entry.function = 0;
                    self.assign_parent_slot(&mut entry);
                } else {
                    entry.function += 1;
                }
                entry
            }
            None => {
                let mut entry = BusEntry::default();
                self.assign_parent_slot(&mut entry);
                entry
            }
        };

        let multifunction = entry.function == 0 && group.is_some();

        let slot = match self.kind {
            BusKind::Pci => PciSlot {
                bus: ROOT_BUS.to_string(),
                addr: format!("{:x}.{}", entry.bridge_device, entry.function),
                multifunction,
            },
            BusKind::Pcie => {
                if entry.function == 0 {
                    let port = RootPortDevice {
                        name: format!("pcie-port-{}", self.next_port),
                        index: self.next_port,
                        device: entry.bridge_device,
                        function: entry.bridge_function,
                    };
                    entry.port_name = Some(port.name.clone());
                    self.next_port += 1;
                    self.root_ports.push(port);
                }
                PciSlot {
                    bus: entry.port_name.clone().unwrap_or_default(),
                    addr: format!("00.{}", entry.function),
                    multifunction,
                }
            }
            BusKind::Ccw => return None,
        };

        if let Some(key) = group {
            self.groups.insert(key.to_string(), entry);
        }

        Some(slot)
    }

    /// Assigns the entry a fresh parent slot: the next device number on a
    /// flat bus, or the next root-port function on PCIe.
    fn assign_parent_slot(&mut self, entry: &mut BusEntry) {
        match self.kind {
            BusKind::Pci => {
                entry.bridge_device = self.next_device;
                self.next_device += 1;
            }
            BusKind::Pcie => {
                let slot = match self.root_port {
                    // The current root-bus slot still has functions free.
                    Some(slot) if slot.function < 7 => RootSlot {
                        device: slot.device,
                        function: slot.function + 1,
                    },
                    _ => {
                        let slot = RootSlot {
                            device: self.next_device,
                            function: 0,
                        };
                        self.next_device += 1;
                        slot
                    }
                };
                entry.bridge_device = slot.device;
                entry.bridge_function = slot.function;
                self.root_port = Some(slot);
            }
            BusKind::Ccw => {}
        }
    }
}
