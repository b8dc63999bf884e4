//! Static resource definitions for a session
//!
//! Resources are fixed at server start: a number of color slots taken from
//! the palette and a number of board spots laid out on a ring around the
//! board center. Only ownership changes at runtime.

use shared::{RegistryKind, ResourceId, ResourcePayload};
use std::f32::consts::TAU;

/// Colors available for color slots, in slot order
pub const PALETTE: [(&str, [u8; 3]); 8] = [
    ("blue", [0x1f, 0x6f, 0xeb]),
    ("red", [0xe0, 0x3a, 0x3a]),
    ("green", [0x2f, 0xb3, 0x4a]),
    ("purple", [0x8a, 0x4b, 0xd6]),
    ("orange", [0xf0, 0x8c, 0x1a]),
    ("cyan", [0x1c, 0xc6, 0xd8]),
    ("magenta", [0xd8, 0x2f, 0xb0]),
    ("yellow", [0xf2, 0xd0, 0x24]),
];

/// The resources of one registry
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    kind: RegistryKind,
    payloads: Vec<ResourcePayload>,
}

impl ResourceCatalog {
    /// The first `count` palette colors. `count` is clamped to the palette size.
    pub fn colors(count: usize) -> Self {
        let payloads = PALETTE
            .iter()
            .take(count)
            .map(|(name, rgb)| ResourcePayload::Color {
                name: (*name).to_string(),
                rgb: *rgb,
            })
            .collect();

        Self {
            kind: RegistryKind::ColorSlot,
            payloads,
        }
    }

    /// `count` spots spread evenly on a circle of `radius` around the origin,
    /// starting at the top of the board and going clockwise
    pub fn board_spots(count: usize, radius: f32) -> Self {
        let payloads = (0..count)
            .map(|i| {
                let angle = TAU * i as f32 / count as f32;
                ResourcePayload::Position {
                    x: radius * angle.sin(),
                    y: -radius * angle.cos(),
                }
            })
            .collect();

        Self {
            kind: RegistryKind::BoardSpot,
            payloads,
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn contains(&self, resource_id: ResourceId) -> bool {
        (resource_id as usize) < self.payloads.len()
    }

    pub fn payload(&self, resource_id: ResourceId) -> Option<&ResourcePayload> {
        self.payloads.get(resource_id as usize)
    }
}
