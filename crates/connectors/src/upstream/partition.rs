//! Partition coordination for upstream inputs.
//!
//! Every instance serves exactly one upstream address, and every address
//! is served by at most one instance. Repartitioning rebinds addresses to
//! fresh instances that inherit the recovery ledger of whichever instance
//! served the address before, so replay resumes where it left off.

use super::config::Address;
use super::error::{Error, Result};
use super::ledger::RecoveryLedger;
use super::source::UpstreamInput;
use sluice_api::{Partition, Partitionable};
use std::collections::HashSet;
use tracing::{debug, info};

/// Rebuild `partitions` as one partition per bound address.
///
/// `incremental_capacity == 0` leaves the set unchanged. On error the set
/// is left unchanged as well.
pub fn redefine_partitions<T: Send + 'static>(
    partitions: &mut Vec<Partition<UpstreamInput<T>>>,
    incremental_capacity: usize,
) -> Result<()> {
    if incremental_capacity == 0 {
        debug!("no capacity change requested, keeping partitions");
        return Ok(());
    }

    let mut bound = HashSet::new();
    let mut rebuilt = Vec::new();
    for partition in partitions.iter() {
        let instance = partition.instance();
        for address in instance.connect_addresses() {
            if !bound.insert(address.clone()) {
                return Err(Error::Partition(format!(
                    "address {} is bound to more than one partition",
                    address
                )));
            }
            rebuilt.push(Partition::new(instance.spawn_partition(
                address.clone(),
                instance.ledger().clone(),
                instance.origin_offset(),
            )));
        }
    }

    info!(
        from = partitions.len(),
        to = rebuilt.len(),
        "redefined upstream input partitions"
    );
    *partitions = rebuilt;
    Ok(())
}

/// Add a partition for every discovered address that no partition serves
/// yet. New partitions start with an empty ledger and replay from the
/// beginning.
///
/// Returns the number of partitions added.
pub fn adopt_addresses<T: Send + 'static>(
    partitions: &mut Vec<Partition<UpstreamInput<T>>>,
    discovered: &[Address],
) -> Result<usize> {
    let bound: HashSet<&Address> = partitions
        .iter()
        .flat_map(|p| p.instance().connect_addresses())
        .collect();
    let mut seen = HashSet::new();
    let unbound: Vec<&Address> = discovered
        .iter()
        .filter(|a| !bound.contains(a) && seen.insert(*a))
        .collect();
    if unbound.is_empty() {
        return Ok(0);
    }

    let template = partitions
        .first()
        .ok_or_else(|| Error::Partition("no partition to derive new partitions from".to_string()))?
        .instance();
    let adopted: Vec<_> = unbound
        .into_iter()
        .map(|address| {
            info!(address = %address, "adopting upstream address");
            Partition::new(template.spawn_partition(address.clone(), RecoveryLedger::new(), 0))
        })
        .collect();

    let count = adopted.len();
    partitions.extend(adopted);
    Ok(count)
}

impl<T: Send + 'static> Partitionable for UpstreamInput<T> {
    fn define_partitions(
        &self,
        partitions: &mut Vec<Partition<Self>>,
        incremental_capacity: usize,
    ) -> sluice_api::Result<()> {
        redefine_partitions(partitions, incremental_capacity).map_err(Into::into)
    }
}
