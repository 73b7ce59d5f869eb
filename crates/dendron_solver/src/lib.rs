#![forbid(unsafe_code)]

//! Assembly and solution of the Hines system arising from the cable
//! equation on a tree of control volumes.
//!
//! Units: conductances in µS, capacitances in pF, currents in nA, voltages
//! in mV, times in ms. Double precision throughout.

/// The numeric backend seam. A backend owns the matrix storage; the engine
/// only ever assembles for a time step and solves into a voltage vector.
pub trait SolverBackend: Send {
    /// Builds the matrix for the given per-cell time steps. A cell with
    /// `dt = 0` produces an identity block: its solve returns the input
    /// voltage unchanged.
    fn assemble(&mut self, dt_ms: &[f64], voltage: &[f64], current_na: &[f64], conductance_us: &[f64]);

    /// Solves the assembled system, writing the new voltages into `to`.
    fn solve(&mut self, to: &mut [f64]);

    fn size(&self) -> usize;
}

/// Hines matrix over one or more cells packed back to back.
///
/// `parent_index[i] == i` marks the root of a cell block; otherwise
/// `parent_index[i] < i` and both indices lie in the same block, so a single
/// bottom-up elimination followed by a top-down substitution solves each
/// block in linear time.
#[derive(Debug, Clone)]
pub struct HinesMatrix {
    parent_index: Vec<usize>,
    cell_cv_divs: Vec<usize>,
    cv_capacitance: Vec<f64>,
    cv_area: Vec<f64>,
    /// Constant part of the diagonal: the sum of incident face conductances.
    invariant_d: Vec<f64>,
    /// Upper off-diagonal, `-face_conductance[i]` for the face to the parent.
    u: Vec<f64>,
    d: Vec<f64>,
    rhs: Vec<f64>,
}

impl HinesMatrix {
    pub fn new(
        parent_index: Vec<usize>,
        cell_cv_divs: Vec<usize>,
        cv_capacitance: Vec<f64>,
        face_conductance: Vec<f64>,
        cv_area: Vec<f64>,
    ) -> Self {
        let n = parent_index.len();
        assert_eq!(cv_capacitance.len(), n, "capacitance per CV");
        assert_eq!(face_conductance.len(), n, "face conductance per CV");
        assert_eq!(cv_area.len(), n, "area per CV");
        assert!(
            cell_cv_divs.first() == Some(&0) && cell_cv_divs.last() == Some(&n),
            "cell partition must cover the packed matrix"
        );
        for cell in cell_cv_divs.windows(2) {
            let (begin, end) = (cell[0], cell[1]);
            assert!(begin <= end, "cell partition must be monotone");
            for i in begin..end {
                let p = parent_index[i];
                if i == begin {
                    assert_eq!(p, i, "block root must be its own parent");
                } else {
                    assert!(p >= begin && p < i, "parent must precede child within its block");
                }
            }
        }

        let mut invariant_d = vec![0.0; n];
        let mut u = vec![0.0; n];
        for i in 0..n {
            let p = parent_index[i];
            if p != i {
                let g = face_conductance[i];
                u[i] = -g;
                invariant_d[i] += g;
                invariant_d[p] += g;
            }
        }

        Self {
            parent_index,
            cell_cv_divs,
            cv_capacitance,
            cv_area,
            invariant_d,
            u,
            d: vec![0.0; n],
            rhs: vec![0.0; n],
        }
    }

    pub fn num_cells(&self) -> usize {
        self.cell_cv_divs.len() - 1
    }

    pub fn parent_index(&self) -> &[usize] {
        &self.parent_index
    }

    pub fn cell_cv_divs(&self) -> &[usize] {
        &self.cell_cv_divs
    }

    /// Direct access for tests that want to poke the assembled state.
    pub fn state_mut(&mut self) -> (&mut [f64], &mut [f64], &mut [f64]) {
        (&mut self.d, &mut self.u, &mut self.rhs)
    }

    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }
}

impl SolverBackend for HinesMatrix {
    fn assemble(
        &mut self,
        dt_ms: &[f64],
        voltage: &[f64],
        current_na: &[f64],
        conductance_us: &[f64],
    ) {
        let n = self.parent_index.len();
        assert_eq!(dt_ms.len(), self.num_cells(), "one dt per cell");
        assert_eq!(voltage.len(), n, "voltage per CV");
        assert_eq!(current_na.len(), n, "current per CV");
        assert_eq!(conductance_us.len(), n, "conductance per CV");

        for (cell, window) in self.cell_cv_divs.windows(2).enumerate() {
            let (begin, end) = (window[0], window[1]);
            let dt = dt_ms[cell];
            if dt > 0.0 {
                // C/dt in pF/ms is nS; 1e-3 rescales to µS. Folding the
                // membrane conductance into gi linearises the mechanism
                // current about the old voltage.
                let factor = 1e-3 / dt;
                for i in begin..end {
                    let gi = factor * self.cv_capacitance[i] + conductance_us[i];
                    self.d[i] = gi + self.invariant_d[i];
                    self.rhs[i] = gi * voltage[i] - current_na[i];
                }
            } else {
                for i in begin..end {
                    self.d[i] = 0.0;
                    self.rhs[i] = voltage[i];
                }
            }
        }
    }

    fn solve(&mut self, to: &mut [f64]) {
        assert_eq!(to.len(), self.parent_index.len(), "solution vector size");
        for window in self.cell_cv_divs.windows(2) {
            let (begin, end) = (window[0], window[1]);
            if begin == end {
                continue;
            }
            if self.d[begin] == 0.0 {
                // Identity block: pass the rhs through untouched.
                to[begin..end].copy_from_slice(&self.rhs[begin..end]);
                continue;
            }
            // Eliminate children into parents, leaves first.
            for i in (begin + 1..end).rev() {
                let factor = self.u[i] / self.d[i];
                let p = self.parent_index[i];
                self.d[p] -= factor * self.u[i];
                self.rhs[p] -= factor * self.rhs[i];
            }
            to[begin] = self.rhs[begin] / self.d[begin];
            // Substitute back down the tree.
            for i in begin + 1..end {
                let p = self.parent_index[i];
                to[i] = (self.rhs[i] - self.u[i] * to[p]) / self.d[i];
            }
        }
    }

    fn size(&self) -> usize {
        self.parent_index.len()
    }
}
