use crate::{accelerator::Accelerator, error::AcceleratorError};

/// Exclusive prefix sum of `values` into `out`, returns the total.
///
/// Two launches: every work-group scans its own chunk, then the group totals are scanned on the
/// control thread and added back to the chunks.
pub fn exclusive_scan(
    accel: &Accelerator,
    threads_per_group: usize,
    values: &[u32],
    out: &mut [u32],
) -> Result<u32, AcceleratorError> {
    assert_eq!(values.len(), out.len());
    if values.is_empty() {
        return Ok(0);
    }

    accel.launch_chunked("scan_groups", threads_per_group, out, |group, chunk| {
        let items = group.items(values.len());
        let mut acc: u32 = 0;
        for (o, &v) in chunk.iter_mut().zip(&values[items]) {
            *o = acc;
            acc = acc.checked_add(v).expect("prefix sum overflows 32 bit");
        }
    })?;

    let num_groups = (values.len() + threads_per_group - 1) / threads_per_group;
    let mut group_offsets = Vec::with_capacity(num_groups);
    let mut total: u32 = 0;
    for g in 0..num_groups {
        group_offsets.push(total);
        let last = ((g + 1) * threads_per_group).min(values.len()) - 1;
        total = total
            .checked_add(out[last] + values[last])
            .ok_or_else(|| AcceleratorError::KernelAborted {
                kernel: "scan_groups",
                message: String::from("prefix sum overflows 32 bit"),
            })?;
    }

    accel.launch_chunked("scan_add_group_offsets", threads_per_group, out, |group, chunk| {
        let offset = group_offsets[group.id];
        for o in chunk {
            *o += offset;
        }
    })?;

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::test_accelerator;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn sequential(values: &[u32]) -> (Vec<u32>, u32) {
        let mut acc = 0;
        let out = values
            .iter()
            .map(|v| {
                let o = acc;
                acc += v;
                o
            })
            .collect();
        (out, acc)
    }

    #[test]
    fn matches_sequential_scan() {
        let accel = test_accelerator();
        let mut rng = StdRng::seed_from_u64(7);

        for &n in &[1usize, 63, 64, 65, 1000, 4097] {
            let values: Vec<u32> = (0..n).map(|_| rng.gen_range(0..10)).collect();
            let mut out = vec![u32::MAX; n];
            let total = exclusive_scan(&accel, 64, &values, &mut out).unwrap();

            let (expected, expected_total) = sequential(&values);
            assert_eq!(out, expected, "n = {}", n);
            assert_eq!(total, expected_total);
        }
    }

    #[test]
    fn empty_input() {
        let accel = test_accelerator();
        assert_eq!(exclusive_scan(&accel, 64, &[], &mut []).unwrap(), 0);
        assert_eq!(accel.launch_count(), 0);
    }

    #[test]
    fn overflow_is_reported() {
        let accel = test_accelerator();
        let values = vec![u32::MAX / 2 + 1; 4];
        let mut out = vec![0; 4];
        assert!(matches!(
            exclusive_scan(&accel, 2, &values, &mut out),
            Err(AcceleratorError::KernelAborted { .. })
        ));
    }
}
