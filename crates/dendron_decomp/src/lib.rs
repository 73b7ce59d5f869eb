#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use dendron_context::ExecutionContext;
use dendron_core::{CellGid, CellKind};
use dendron_recipe::Recipe;
use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Multicore,
    Gpu,
}

/// One unit of integration: same kind, same backend, one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescription {
    pub kind: CellKind,
    pub gids: Vec<CellGid>,
    pub backend: BackendKind,
}

pub const DEFAULT_GROUP_SIZE: usize = 1024;

/// Tunes how a domain's cells are cut into groups. Gap-junction components
/// are indivisible and ignore the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHint {
    /// Upper bound on the number of independent same-kind cells per group.
    pub group_size: usize,
}

impl Default for PartitionHint {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainDecomposition {
    pub num_domains: usize,
    pub domain_id: usize,
    pub num_global_cells: usize,
    pub num_local_cells: usize,
    pub groups: Vec<GroupDescription>,
    gid_domain: Vec<usize>,
}

impl DomainDecomposition {
    /// Assembles an externally specified decomposition. `gid_domain` maps
    /// every global gid to its owning domain and must agree with `groups`;
    /// run `check_decomposition` on the result before using it.
    pub fn new(
        num_domains: usize,
        domain_id: usize,
        num_global_cells: usize,
        groups: Vec<GroupDescription>,
        gid_domain: Vec<usize>,
    ) -> Self {
        assert_eq!(
            gid_domain.len(),
            num_global_cells,
            "one domain entry per global cell"
        );
        let num_local_cells = groups.iter().map(|g| g.gids.len()).sum();
        Self {
            num_domains,
            domain_id,
            num_global_cells,
            num_local_cells,
            groups,
            gid_domain,
        }
    }

    pub fn gid_domain(&self, gid: CellGid) -> usize {
        self.gid_domain[gid.0 as usize]
    }

    pub fn local_gids(&self) -> impl Iterator<Item = CellGid> + '_ {
        self.groups.iter().flat_map(|g| g.gids.iter().copied())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecompError {
    #[error("gid {0} appears in more than one cell group")]
    DuplicateGid(CellGid),
    #[error("gid {gid} is out of bounds for a simulation of {num_cells} cells")]
    OutOfBounds { gid: CellGid, num_cells: usize },
    #[error("local cell counts sum to {sum} over all ranks, expected {expected}")]
    InvalidSumLocalCells { sum: usize, expected: usize },
    #[error("rank {rank} requests a GPU group but the context has no GPU")]
    InvalidBackend { rank: usize },
    #[error("rank {rank} requests a GPU group for kind {kind:?} which has no GPU support")]
    IncompatibleBackend { rank: usize, kind: CellKind },
    #[error("cells {0} and {1} are gap-junction coupled but placed on different domains")]
    InvalidGjCellGroup(CellGid, CellGid),
}

fn gpu_runnable(kind: CellKind) -> bool {
    matches!(kind, CellKind::Cable)
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Attach the larger root id under the smaller so component
            // representatives are stable across insertion orders.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// `partition_load_balance_with_hint` under the default hint.
pub fn partition_load_balance(
    recipe: &dyn Recipe,
    ctx: &ExecutionContext,
) -> Result<DomainDecomposition, DecompError> {
    partition_load_balance_with_hint(recipe, ctx, PartitionHint::default())
}

/// Assigns every cell to exactly one domain and splits each domain's cells
/// into cell groups.
///
/// Gap-junction-connected components are indivisible: each component goes to
/// one domain, largest components first, round-robin over domains. Cells
/// without gap junctions are round-robin'd by gid. Within a domain, cells
/// split by (kind, backend) into groups of at most `hint.group_size`;
/// components keep their own group regardless of the hint.
pub fn partition_load_balance_with_hint(
    recipe: &dyn Recipe,
    ctx: &ExecutionContext,
    hint: PartitionHint,
) -> Result<DomainDecomposition, DecompError> {
    let group_size = hint.group_size.max(1);
    let num_domains = ctx.distributed.size();
    let domain_id = ctx.distributed.rank();
    let num_cells = recipe.num_cells();

    // Connected components over the gap-junction graph.
    let mut uf = UnionFind::new(num_cells);
    let mut in_component = vec![false; num_cells];
    for raw in 0..num_cells as u32 {
        let gid = CellGid(raw);
        for junction in recipe.gap_junctions_on(gid) {
            let peer = junction.peer.gid.0 as usize;
            if peer >= num_cells {
                return Err(DecompError::OutOfBounds {
                    gid: junction.peer.gid,
                    num_cells,
                });
            }
            in_component[raw as usize] = true;
            in_component[peer] = true;
            uf.union(raw as usize, peer);
        }
    }

    let mut components: BTreeMap<usize, Vec<CellGid>> = BTreeMap::new();
    for cell in 0..num_cells {
        if in_component[cell] {
            let root = uf.find(cell);
            components.entry(root).or_default().push(CellGid(cell as u32));
        }
    }

    // Largest first; ties broken by lowest member gid for determinism.
    let ordered: Vec<Vec<CellGid>> = components
        .into_values()
        .sorted_by_key(|members| (std::cmp::Reverse(members.len()), members[0]))
        .collect();

    let mut gid_domain = vec![usize::MAX; num_cells];
    for (index, members) in ordered.iter().enumerate() {
        let domain = index % num_domains;
        for gid in members {
            gid_domain[gid.0 as usize] = domain;
        }
    }
    let mut next = 0usize;
    for cell in 0..num_cells {
        if !in_component[cell] {
            gid_domain[cell] = next % num_domains;
            next += 1;
        }
    }

    // Local groups: one per gap-junction component, then one per kind for
    // the independent cells.
    let mut groups = Vec::new();
    for (index, members) in ordered.iter().enumerate() {
        if index % num_domains != domain_id {
            continue;
        }
        let kind = recipe.cell_kind(members[0]);
        groups.push(GroupDescription {
            kind,
            gids: members.clone(),
            backend: BackendKind::Multicore,
        });
    }
    let mut by_kind: BTreeMap<u8, Vec<CellGid>> = BTreeMap::new();
    for cell in 0..num_cells {
        if !in_component[cell] && gid_domain[cell] == domain_id {
            let gid = CellGid(cell as u32);
            let kind = recipe.cell_kind(gid);
            by_kind
                .entry(dendron_core::cell_kind_code(kind))
                .or_default()
                .push(gid);
        }
    }
    for (code, gids) in by_kind {
        let kind = recipe.cell_kind(gids[0]);
        debug_assert_eq!(dendron_core::cell_kind_code(kind), code);
        for chunk in gids.chunks(group_size) {
            groups.push(GroupDescription {
                kind,
                gids: chunk.to_vec(),
                backend: BackendKind::Multicore,
            });
        }
    }

    let num_local_cells = groups.iter().map(|g| g.gids.len()).sum();
    let decomposition = DomainDecomposition {
        num_domains,
        domain_id,
        num_global_cells: num_cells,
        num_local_cells,
        groups,
        gid_domain,
    };
    check_decomposition(recipe, ctx, &decomposition)?;
    Ok(decomposition)
}

/// Validates a decomposition, including one supplied by the user rather
/// than produced by `partition_load_balance`.
pub fn check_decomposition(
    recipe: &dyn Recipe,
    ctx: &ExecutionContext,
    decomposition: &DomainDecomposition,
) -> Result<(), DecompError> {
    let num_cells = decomposition.num_global_cells;
    let mut seen = BTreeSet::new();
    for group in &decomposition.groups {
        for &gid in &group.gids {
            if gid.0 as usize >= num_cells {
                return Err(DecompError::OutOfBounds { gid, num_cells });
            }
            if !seen.insert(gid) {
                return Err(DecompError::DuplicateGid(gid));
            }
        }
        if group.backend == BackendKind::Gpu {
            if !ctx.gpu_available {
                return Err(DecompError::InvalidBackend {
                    rank: decomposition.domain_id,
                });
            }
            if !gpu_runnable(group.kind) {
                return Err(DecompError::IncompatibleBackend {
                    rank: decomposition.domain_id,
                    kind: group.kind,
                });
            }
        }
    }

    let sum = ctx.distributed.sum(decomposition.num_local_cells as u64) as usize;
    if sum != num_cells {
        return Err(DecompError::InvalidSumLocalCells {
            sum,
            expected: num_cells,
        });
    }

    // Every gap junction incident to a local cell must stay on this domain.
    for &gid in &seen {
        for junction in recipe.gap_junctions_on(gid) {
            if decomposition.gid_domain(junction.peer.gid) != decomposition.domain_id {
                return Err(DecompError::InvalidGjCellGroup(gid, junction.peer.gid));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendron_recipe::{CellDescription, CellGlobalLabel, CellLocalLabel, GapJunctionDesc, LifCell};

    struct Plain(usize);

    impl Recipe for Plain {
        fn num_cells(&self) -> usize {
            self.0
        }
        fn cell_kind(&self, _gid: CellGid) -> CellKind {
            CellKind::Lif
        }
        fn cell_description(&self, _gid: CellGid) -> CellDescription {
            CellDescription::Lif(LifCell::default())
        }
    }

    #[test]
    fn independent_cells_form_one_group_per_kind() {
        let ctx = ExecutionContext::local(1);
        let decomposition = partition_load_balance(&Plain(10), &ctx).unwrap();
        assert_eq!(decomposition.num_local_cells, 10);
        assert_eq!(decomposition.groups.len(), 1);
        assert_eq!(decomposition.groups[0].gids.len(), 10);
        for raw in 0..10 {
            assert_eq!(decomposition.gid_domain(CellGid(raw)), 0);
        }
    }

    #[test]
    fn group_size_hint_chunks_independent_cells() {
        let ctx = ExecutionContext::local(1);
        let decomposition = partition_load_balance_with_hint(
            &Plain(10),
            &ctx,
            PartitionHint { group_size: 4 },
        )
        .unwrap();
        assert_eq!(decomposition.num_local_cells, 10);
        let sizes: Vec<usize> = decomposition.groups.iter().map(|g| g.gids.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        // Chunks keep the gid order, so queue indices stay dense.
        let flat: Vec<CellGid> = decomposition.local_gids().collect();
        assert_eq!(flat, (0..10).map(CellGid).collect::<Vec<_>>());
    }

    #[test]
    fn gj_components_ignore_the_hint() {
        let ctx = ExecutionContext::local(1);
        let decomposition = partition_load_balance_with_hint(
            &PairedGj,
            &ctx,
            PartitionHint { group_size: 1 },
        )
        .unwrap();
        assert_eq!(decomposition.groups.len(), 2);
        for group in &decomposition.groups {
            assert_eq!(group.gids.len(), 2);
        }
    }

    struct PairedGj;

    impl Recipe for PairedGj {
        fn num_cells(&self) -> usize {
            4
        }
        fn cell_kind(&self, _gid: CellGid) -> CellKind {
            CellKind::Lif
        }
        fn cell_description(&self, _gid: CellGid) -> CellDescription {
            CellDescription::Lif(LifCell::default())
        }
        fn gap_junctions_on(&self, gid: CellGid) -> Vec<GapJunctionDesc> {
            // Two disjoint pairs: (0, 1) and (2, 3).
            let peer = match gid.0 {
                0 => 1,
                1 => 0,
                2 => 3,
                3 => 2,
                _ => unreachable!(),
            };
            vec![GapJunctionDesc {
                peer: CellGlobalLabel::new(peer, CellLocalLabel::univalent("gj")),
                local: CellLocalLabel::univalent("gj"),
                conductance_us: 0.05,
            }]
        }
    }

    #[test]
    fn gj_pairs_stay_whole() {
        let ctx = ExecutionContext::local(1);
        let decomposition = partition_load_balance(&PairedGj, &ctx).unwrap();
        assert_eq!(decomposition.groups.len(), 2);
        for group in &decomposition.groups {
            assert_eq!(group.gids.len(), 2);
        }
    }

    #[test]
    fn duplicate_gid_is_rejected() {
        let ctx = ExecutionContext::local(1);
        let recipe = Plain(2);
        let bad = DomainDecomposition {
            num_domains: 1,
            domain_id: 0,
            num_global_cells: 2,
            num_local_cells: 2,
            groups: vec![GroupDescription {
                kind: CellKind::Lif,
                gids: vec![CellGid(0), CellGid(0)],
                backend: BackendKind::Multicore,
            }],
            gid_domain: vec![0, 0],
        };
        assert_eq!(
            check_decomposition(&recipe, &ctx, &bad),
            Err(DecompError::DuplicateGid(CellGid(0)))
        );
    }

    #[test]
    fn gpu_group_needs_gpu() {
        let ctx = ExecutionContext::local(1);
        let recipe = Plain(1);
        let bad = DomainDecomposition {
            num_domains: 1,
            domain_id: 0,
            num_global_cells: 1,
            num_local_cells: 1,
            groups: vec![GroupDescription {
                kind: CellKind::Lif,
                gids: vec![CellGid(0)],
                backend: BackendKind::Gpu,
            }],
            gid_domain: vec![0],
        };
        assert_eq!(
            check_decomposition(&recipe, &ctx, &bad),
            Err(DecompError::InvalidBackend { rank: 0 })
        );
    }
}
