/*!
Neighborhood search for position based fluids.

Every simulation step the caller hands over fluid and boundary positions, the index sorts them into a uniform
grid with cell size equal to the interaction radius and builds a CSR neighbor list for all particles.

```no_run
use sph_nsearch::{vec3f, DomainParams, SearchParams, SpatialIndex};

let params = SearchParams::new(0.1, DomainParams::new(1.0, 1.0, 1.0), 1000);
let mut index = SpatialIndex::new(params).unwrap();

let fluid = vec![vec3f(0.5, 0.5, 0.5), vec3f(0.55, 0.5, 0.5)];
index.neighborhood_search(&fluid, &[]).unwrap();

let slot = index.part_idx(0);
for k in 0..index.n_neighbors(slot) {
    println!("0 <-> {}", index.neighbor(slot, k));
}
index.update();
```
*/

mod spatial;

pub use spatial::*;
