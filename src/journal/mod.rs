//! Volume/snapshot identity and the reservation journal
//!
//! - [`identifier`]: handle codec
//! - [`reservation`]: request name <-> backing object index in the cluster

pub mod identifier;
pub mod reservation;

pub use identifier::{ObjectIdentifier, FIXED_ID_LEN, ID_VERSION, MAX_CLUSTER_ID_LEN};
pub use reservation::{Journal, JournalConfig, Lineage, Reservation, ReservationAttrs};
