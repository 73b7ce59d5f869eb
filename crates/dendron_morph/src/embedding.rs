use crate::{Mcable, Mlocation, Morphology, PI};

/// Geometric queries over a morphology. Branch positions are relative to
/// arc length, so `pos = 0.5` is the half-way point of the branch.
///
/// All lengths and radii are in µm. `integrate_ixa` returns the geometric
/// factor `∫ dx / (π r(x)²)` in 1/µm; multiplied by an axial resistivity in
/// Ω·cm the reciprocal scales to µS with the factor 100.
#[derive(Debug, Clone)]
pub struct Embedding {
    branch_lengths: Vec<f64>,
    // Per branch: cumulative arc length at segment boundaries, starting at 0.
    segment_divs: Vec<Vec<f64>>,
}

impl Embedding {
    pub fn new(morphology: &Morphology) -> Self {
        let mut branch_lengths = Vec::with_capacity(morphology.num_branches());
        let mut segment_divs = Vec::with_capacity(morphology.num_branches());
        for id in 0..morphology.num_branches() as u32 {
            let branch = morphology.branch(id);
            let mut divs = Vec::with_capacity(branch.segments.len() + 1);
            let mut acc = 0.0;
            divs.push(0.0);
            for segment in &branch.segments {
                acc += segment.length_um;
                divs.push(acc);
            }
            branch_lengths.push(acc);
            segment_divs.push(divs);
        }
        Self {
            branch_lengths,
            segment_divs,
        }
    }

    pub fn branch_length(&self, branch: u32) -> f64 {
        self.branch_lengths[branch as usize]
    }

    /// Radius at a location, linear in arc length within a segment.
    pub fn radius_at(&self, morphology: &Morphology, loc: Mlocation) -> f64 {
        let arc = loc.pos.clamp(0.0, 1.0) * self.branch_length(loc.branch);
        let divs = &self.segment_divs[loc.branch as usize];
        let segments = &morphology.branch(loc.branch).segments;
        let index = match divs.windows(2).position(|w| arc <= w[1]) {
            Some(i) => i,
            None => segments.len() - 1,
        };
        let segment = &segments[index];
        let t = if segment.length_um > 0.0 {
            (arc - divs[index]) / segment.length_um
        } else {
            0.0
        };
        segment.radius_prox_um + t * (segment.radius_dist_um - segment.radius_prox_um)
    }

    pub fn integrate_length(&self, cable: &Mcable) -> f64 {
        (cable.dist_pos - cable.prox_pos).max(0.0) * self.branch_length(cable.branch)
    }

    /// Lateral membrane area of the cable in µm², summing exact frustum
    /// slant areas.
    pub fn integrate_area(&self, morphology: &Morphology, cable: &Mcable) -> f64 {
        self.sum_over_segments(morphology, cable, |h, r_a, r_b| {
            PI * (r_a + r_b) * (h * h + (r_b - r_a) * (r_b - r_a)).sqrt()
        })
    }

    /// `∫ dx / (π r(x)²)` over the cable in 1/µm; exact per frustum:
    /// `h / (π r_a r_b)`.
    pub fn integrate_ixa(&self, morphology: &Morphology, cable: &Mcable) -> f64 {
        self.sum_over_segments(morphology, cable, |h, r_a, r_b| h / (PI * r_a * r_b))
    }

    fn sum_over_segments<F>(&self, morphology: &Morphology, cable: &Mcable, piece: F) -> f64
    where
        F: Fn(f64, f64, f64) -> f64,
    {
        let branch_len = self.branch_length(cable.branch);
        let lo = cable.prox_pos.clamp(0.0, 1.0) * branch_len;
        let hi = cable.dist_pos.clamp(0.0, 1.0) * branch_len;
        if hi <= lo {
            return 0.0;
        }
        let divs = &self.segment_divs[cable.branch as usize];
        let segments = &morphology.branch(cable.branch).segments;
        let mut total = 0.0;
        for (index, segment) in segments.iter().enumerate() {
            let seg_lo = divs[index];
            let seg_hi = divs[index + 1];
            let a = lo.max(seg_lo);
            let b = hi.min(seg_hi);
            if b <= a {
                continue;
            }
            let h = b - a;
            let taper = (segment.radius_dist_um - segment.radius_prox_um) / segment.length_um;
            let r_a = segment.radius_prox_um + taper * (a - seg_lo);
            let r_b = segment.radius_prox_um + taper * (b - seg_lo);
            total += piece(h, r_a, r_b);
        }
        total
    }
}
