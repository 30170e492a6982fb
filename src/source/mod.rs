// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Vendor adapters.
//!
//! Each adapter hides one vendor's authentication scheme, device discovery
//! and payload format behind [`SourceAdapter`]. Everything downstream sees
//! only UTC [`Record`](crate::Record)s.

mod http;
pub mod icmeter;
pub mod netatmo;
pub mod smappee;
pub mod traits;
pub mod wirelesstag;

pub use icmeter::{IcMeterAdapter, IcMeterConfig};
pub use netatmo::{NetatmoAdapter, NetatmoConfig};
pub use smappee::{SmappeeAdapter, SmappeeConfig};
pub use traits::{AuthError, Credential, FetchError, SourceAdapter};
pub use wirelesstag::{WirelessTagAdapter, WirelessTagConfig};
