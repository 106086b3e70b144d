//! Disaster-recovery identity mapping

mod resolver;

pub use resolver::{ClusterMapping, MappingResolver, MappingSource};
