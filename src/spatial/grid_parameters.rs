use crate::{error::ConfigError, floating_type_mod::FT, search_parameters::DomainParams, V3, VI3, VU3};

/// Uniform grid over the simulation domain. Cells are cubes with edge length equal to the
/// interaction radius, so all neighbors of a particle lie in the 3x3x3 cells around its own cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridParameters {
    radius: FT,
    cell_size: FT,
    origin: V3,
    dims: VU3,
}

impl GridParameters {
    pub fn new(radius: FT, domain: &DomainParams) -> Result<GridParameters, ConfigError> {
        if !(radius.is_finite() && radius > 0.) {
            return Err(ConfigError::InvalidRadius(radius));
        }
        let extent = domain.extent();
        if extent.iter().any(|e| !(e.is_finite() && *e > 0.)) {
            return Err(ConfigError::InvalidDomain(extent));
        }

        let cell_size = radius;
        let dims_u64 = extent.map(|e| ((e / cell_size).ceil() as u64).max(1));

        let num_cells = dims_u64.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d));
        match num_cells {
            Some(n) if n <= u32::MAX as u64 => {}
            _ => return Err(ConfigError::TooManyCells { dims: dims_u64 }),
        }

        Ok(GridParameters {
            radius,
            cell_size,
            origin: domain.origin(),
            dims: VU3::new(dims_u64[0] as u32, dims_u64[1] as u32, dims_u64[2] as u32),
        })
    }

    pub fn radius(&self) -> FT {
        self.radius
    }

    pub fn cell_size(&self) -> FT {
        self.cell_size
    }

    pub fn origin(&self) -> V3 {
        self.origin
    }

    pub fn dims(&self) -> VU3 {
        self.dims
    }

    pub fn num_cells(&self) -> usize {
        self.dims.fold(1, |acc, x| acc * x as usize)
    }

    /// Unclamped cell coordinates of a position.
    pub fn raw_cell_pos(&self, position: V3) -> VI3 {
        ((position - self.origin) / self.cell_size).map(|x| {
            let c = x.floor();
            // saturating float -> int conversion keeps far-away (or NaN) positions well defined
            c as i32
        })
    }

    /// Cell coordinates of a position, clamped to the grid. The flag tells whether clamping happened.
    pub fn cell_pos(&self, position: V3) -> (VI3, bool) {
        let raw = self.raw_cell_pos(position);
        let mut clamped = false;
        let mut cell_pos = raw;
        for d in 0..3 {
            let max = self.dims[d] as i32 - 1;
            if raw[d] < 0 {
                cell_pos[d] = 0;
                clamped = true;
            } else if raw[d] > max {
                cell_pos[d] = max;
                clamped = true;
            }
        }
        (cell_pos, clamped)
    }

    pub fn contains_cell(&self, cell_pos: VI3) -> bool {
        (0..3).all(|d| 0 <= cell_pos[d] && (cell_pos[d] as u32) < self.dims[d])
    }

    pub fn cell_id(&self, cell_pos: VI3) -> u32 {
        debug_assert!(self.contains_cell(cell_pos));

        let mut multiplier = 1;
        let mut idx = 0;
        for d in 0..3 {
            idx += multiplier * cell_pos[d] as u32;
            multiplier *= self.dims[d];
        }
        idx
    }

    pub fn cell_pos_of_id(&self, cell_id: u32) -> VI3 {
        let x = cell_id % self.dims.x;
        let y = (cell_id / self.dims.x) % self.dims.y;
        let z = cell_id / (self.dims.x * self.dims.y);
        VI3::new(x as i32, y as i32, z as i32)
    }

    /// Linear cell id of a position, clamped to the grid.
    pub fn cell_id_of(&self, position: V3) -> (u32, bool) {
        let (cell_pos, clamped) = self.cell_pos(position);
        (self.cell_id(cell_pos), clamped)
    }

    /// Calls `f` with the ids of all cells in the 3x3x3 block around `cell_pos` that lie inside
    /// the grid, in ascending id order.
    pub fn iterate_neighbor_cells(&self, cell_pos: VI3, mut f: impl FnMut(u32)) {
        for z in -1..=1 {
            for y in -1..=1 {
                for x in -1..=1 {
                    let neigh = cell_pos + VI3::new(x, y, z);
                    if self.contains_cell(neigh) {
                        f(self.cell_id(neigh));
                    }
                }
            }
        }
    }

    /// Whether two cell ids lie in the same grid row (same y and z).
    pub fn same_row(&self, a: u32, b: u32) -> bool {
        a / self.dims.x == b / self.dims.x
    }
}
