#![forbid(unsafe_code)]

use dendron_context::{ExecutionContext, GatheredVector};
use dendron_core::{
    make_index, update_f64, update_u32, update_u64, CellAddress, CellGid, CellLid, Spike,
    SpikeEvent, TimeMs,
};
use dendron_decomp::DomainDecomposition;
use dendron_labels::{LabelError, LabelResolutionMap, Resolver};
use dendron_recipe::Recipe;
use log::debug;
use rayon::prelude::*;
use thiserror::Error;

/// A fully resolved incoming edge. `index_on_domain` is the index of the
/// target cell among this domain's cells, which is also the index of its
/// event queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub source: CellAddress,
    pub target: CellLid,
    pub weight: f32,
    pub delay_ms: TimeMs,
    pub index_on_domain: usize,
}

impl Connection {
    fn order_key(conn: &Connection) -> (CellAddress, CellLid) {
        (conn.source, conn.target)
    }

    pub fn make_event(&self, spike: &Spike) -> SpikeEvent {
        SpikeEvent::new(self.target, spike.time + self.delay_ms, self.weight)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommError {
    #[error("connection targeting cell {gid} has non-positive delay {delay} ms")]
    NonPositiveDelay { gid: CellGid, delay: TimeMs },
    #[error("connection targeting cell {gid} has non-finite weight {weight}")]
    NonFiniteWeight { gid: CellGid, weight: f32 },
    #[error(transparent)]
    Label(#[from] LabelError),
}

/// Owns the connection table of this domain and drives spike exchange and
/// delivery-event construction.
///
/// Connections are partitioned by the domain of their source gid and each
/// partition is sorted by source `(gid, lid)` then target lid, matching the
/// source-sorted spike slabs produced by the exchange.
#[derive(Debug)]
pub struct Communicator {
    num_domains: usize,
    num_local_groups: usize,
    num_local_cells: usize,
    connections: Vec<Connection>,
    connection_part: Vec<usize>,
    index_divisions: Vec<usize>,
    num_spikes: u64,
}

impl Communicator {
    pub fn new(
        recipe: &dyn Recipe,
        dom_dec: &DomainDecomposition,
        label_map: &LabelResolutionMap,
        ctx: &ExecutionContext,
    ) -> Result<Self, CommError> {
        let num_domains = ctx.distributed.size();

        // Local gids in group order; a cell's position here is its queue
        // index. Groups own the contiguous queue ranges recorded in
        // index_divisions.
        let mut owners: Vec<CellGid> = Vec::with_capacity(dom_dec.num_local_cells);
        let group_sizes: Vec<usize> = dom_dec.groups.iter().map(|g| g.gids.len()).collect();
        let index_divisions = make_index(&group_sizes);
        for group in &dom_dec.groups {
            owners.extend(group.gids.iter().copied());
        }

        // Resolve the incoming connections of every local cell. Round-robin
        // cursors are owned by a single resolver so repeated references to
        // one label advance the same cursor.
        let mut resolver = Resolver::new(label_map);
        let mut resolved: Vec<Vec<Connection>> = Vec::with_capacity(owners.len());
        for (cell_index, &gid) in owners.iter().enumerate() {
            let descs = recipe.connections_on(gid);
            let mut conns = Vec::with_capacity(descs.len());
            for desc in descs {
                if desc.delay_ms <= 0.0 {
                    return Err(CommError::NonPositiveDelay {
                        gid,
                        delay: desc.delay_ms,
                    });
                }
                if !desc.weight.is_finite() {
                    return Err(CommError::NonFiniteWeight {
                        gid,
                        weight: desc.weight,
                    });
                }
                let source_lid =
                    resolver.resolve(desc.source.gid, &desc.source.label.tag, desc.source.label.policy)?;
                let target_lid = resolver.resolve(gid, &desc.target.tag, desc.target.policy)?;
                conns.push(Connection {
                    source: CellAddress {
                        gid: desc.source.gid,
                        lid: source_lid,
                    },
                    target: target_lid,
                    weight: desc.weight,
                    delay_ms: desc.delay_ms,
                    index_on_domain: cell_index,
                });
            }
            resolved.push(conns);
        }

        // Partition by the source's domain, then sort each partition.
        let mut src_counts = vec![0usize; num_domains];
        for conns in &resolved {
            for conn in conns {
                src_counts[dom_dec.gid_domain(conn.source.gid)] += 1;
            }
        }
        let connection_part = make_index(&src_counts);
        let mut offsets = connection_part.clone();
        let total: usize = resolved.iter().map(Vec::len).sum();
        let mut connections = vec![
            Connection {
                source: CellAddress::new(0, 0),
                target: CellLid(0),
                weight: 0.0,
                delay_ms: 0.0,
                index_on_domain: 0,
            };
            total
        ];
        for conns in &resolved {
            for conn in conns {
                let domain = dom_dec.gid_domain(conn.source.gid);
                connections[offsets[domain]] = *conn;
                offsets[domain] += 1;
            }
        }

        // One independent sort per source domain.
        let part = connection_part.clone();
        ctx.thread_pool.install(|| {
            split_into_parts(&mut connections, &part)
                .into_par_iter()
                .for_each(|slab| slab.sort_unstable_by_key(Connection::order_key));
        });

        debug!(
            "connection table built: {} connections over {} domains",
            total, num_domains
        );

        Ok(Self {
            num_domains,
            num_local_groups: dom_dec.groups.len(),
            num_local_cells: dom_dec.num_local_cells,
            connections,
            connection_part,
            index_divisions,
            num_spikes: 0,
        })
    }

    pub fn num_local_cells(&self) -> usize {
        self.num_local_cells
    }

    pub fn num_local_groups(&self) -> usize {
        self.num_local_groups
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection_part(&self) -> &[usize] {
        &self.connection_part
    }

    /// The range of event queues that belong to the cells of group `i`.
    pub fn group_queue_range(&self, i: usize) -> (usize, usize) {
        assert!(i < self.num_local_groups, "group index in range");
        (self.index_divisions[i], self.index_divisions[i + 1])
    }

    /// Minimum delay over the whole network, reduced over all ranks. With no
    /// connections anywhere the result is infinite and the epoch length is
    /// bounded by the integration horizon instead.
    pub fn min_delay(&self, ctx: &ExecutionContext) -> TimeMs {
        let local = self
            .connections
            .iter()
            .map(|c| c.delay_ms)
            .fold(f64::INFINITY, f64::min);
        ctx.distributed.min_time(local)
    }

    /// Sorts the local spikes by source and gathers every rank's
    /// contribution.
    pub fn exchange(
        &mut self,
        mut local_spikes: Vec<Spike>,
        ctx: &ExecutionContext,
    ) -> GatheredVector<Spike> {
        local_spikes.sort_by(|a, b| {
            (a.source, a.time)
                .partial_cmp(&(b.source, b.time))
                .expect("spike times are finite")
        });
        let global_spikes = ctx.distributed.gather_spikes(local_spikes);
        self.num_spikes += global_spikes.size() as u64;
        global_spikes
    }

    /// Appends one event per matching (spike, connection) pair to the queue
    /// of the connection's target cell.
    ///
    /// Per domain we iterate over whichever of the spike slab and the
    /// connection slab is smaller and binary-search the other, giving
    /// O(max(S log C, C log S)).
    pub fn make_event_queues(
        &self,
        global_spikes: &GatheredVector<Spike>,
        queues: &mut [Vec<SpikeEvent>],
    ) {
        assert_eq!(
            queues.len(),
            self.num_local_cells,
            "one event queue per local cell"
        );
        let spike_part = global_spikes.partition();
        for domain in 0..self.num_domains {
            let cons =
                &self.connections[self.connection_part[domain]..self.connection_part[domain + 1]];
            let spikes = &global_spikes.values()[spike_part[domain]..spike_part[domain + 1]];
            if cons.len() < spikes.len() {
                enqueue_by_connections(cons, spikes, queues);
            } else {
                enqueue_by_spikes(cons, spikes, queues);
            }
        }
    }

    pub fn num_spikes(&self) -> u64 {
        self.num_spikes
    }

    pub fn reset(&mut self) {
        self.num_spikes = 0;
    }

    pub fn config_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"DENDRON:COMM:CFG");
        update_u32(&mut hasher, self.num_domains as u32);
        update_u32(&mut hasher, self.num_local_cells as u32);
        update_u32(&mut hasher, self.connections.len() as u32);
        for conn in &self.connections {
            update_u32(&mut hasher, conn.source.gid.0);
            update_u32(&mut hasher, conn.source.lid.0);
            update_u32(&mut hasher, conn.target.0);
            update_f64(&mut hasher, conn.weight as f64);
            update_f64(&mut hasher, conn.delay_ms);
            update_u64(&mut hasher, conn.index_on_domain as u64);
        }
        for &part in &self.connection_part {
            update_u64(&mut hasher, part as u64);
        }
        *hasher.finalize().as_bytes()
    }
}

/// Splits a slice into the disjoint sub-slices described by a partition.
fn split_into_parts<'a, T>(mut slice: &'a mut [T], part: &[usize]) -> Vec<&'a mut [T]> {
    let mut out = Vec::with_capacity(part.len().saturating_sub(1));
    let mut consumed = 0usize;
    for window in part.windows(2) {
        let len = window[1] - window[0];
        debug_assert_eq!(window[0], consumed);
        let (head, tail) = slice.split_at_mut(len);
        out.push(head);
        slice = tail;
        consumed += len;
    }
    out
}

fn spikes_with_source(spikes: &[Spike], source: CellAddress) -> &[Spike] {
    let lo = spikes.partition_point(|s| s.source < source);
    let hi = spikes.partition_point(|s| s.source <= source);
    &spikes[lo..hi]
}

fn connections_with_source(cons: &[Connection], source: CellAddress) -> &[Connection] {
    let lo = cons.partition_point(|c| c.source < source);
    let hi = cons.partition_point(|c| c.source <= source);
    &cons[lo..hi]
}

fn enqueue_by_connections(cons: &[Connection], spikes: &[Spike], queues: &mut [Vec<SpikeEvent>]) {
    let mut spikes = spikes;
    for conn in cons {
        let matched = spikes_with_source(spikes, conn.source);
        for spike in matched {
            queues[conn.index_on_domain].push(conn.make_event(spike));
        }
        // Later connections may share this source; only drop spikes with
        // strictly earlier sources.
        let lo = spikes.partition_point(|s| s.source < conn.source);
        spikes = &spikes[lo..];
        if spikes.is_empty() {
            break;
        }
    }
}

fn enqueue_by_spikes(cons: &[Connection], spikes: &[Spike], queues: &mut [Vec<SpikeEvent>]) {
    let mut cons = cons;
    for spike in spikes {
        let matched = connections_with_source(cons, spike.source);
        for conn in matched {
            queues[conn.index_on_domain].push(conn.make_event(spike));
        }
        // Spikes are sorted by source, so connections with strictly earlier
        // sources can never match again; equal sources must stay for the
        // next spike of the same source.
        let lo = cons.partition_point(|c| c.source < spike.source);
        cons = &cons[lo..];
        if cons.is_empty() {
            break;
        }
    }
}
