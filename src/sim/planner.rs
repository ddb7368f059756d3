//! Improved Hungarian Assignment: orders a class's waiting jobs against
//! its machines by a weighted blend of normalized flow-time and machine
//! workload, solved as a square-padded minimum-cost assignment.

pub const DEFAULT_WEIGHTS: (f64, f64) = (0.6, 0.4);

/// Padding cost for cells with no real job/machine behind them.
const SENTINEL_COST: f64 = 99.0;
const RANGE_EPS: f64 = 1e-9;

/// Flow-time input record, one per queued job.
#[derive(Debug, Clone, Copy)]
pub struct FlowCost {
    pub remaining_ticks: u32,
}

/// Workload input record, one per machine of the class.
#[derive(Debug, Clone, Copy)]
pub struct LoadCost {
    pub workload: f64,
}

/// Compute the assignment and return `(job_index, machine_index)` pairs,
/// cheapest pairing first; that order becomes the new queue prefix.
/// Empty input on either side yields no assignments.
pub fn plan(jobs: &[FlowCost], machines: &[LoadCost], weights: (f64, f64)) -> Vec<(usize, usize)> {
    let n = jobs.len();
    let m = machines.len();
    if n == 0 || m == 0 {
        return Vec::new();
    }
    let k = n.max(m);

    let mut flow = vec![vec![SENTINEL_COST; k]; k];
    let mut load = vec![vec![SENTINEL_COST; k]; k];
    for (i, job) in jobs.iter().enumerate() {
        for (j, machine) in machines.iter().enumerate() {
            flow[i][j] = f64::from(job.remaining_ticks);
            load[i][j] = machine.workload;
        }
    }
    normalize(&mut flow);
    normalize(&mut load);

    let (w1, w2) = weights;
    let total = if w1 + w2 == 0.0 { 1.0 } else { w1 + w2 };
    let (w1, w2) = (w1 / total, w2 / total);

    let cost: Vec<Vec<f64>> = (0..k)
        .map(|i| (0..k).map(|j| w1 * flow[i][j] + w2 * load[i][j]).collect())
        .collect();

    // The augmenting-path solver requires finite costs; anything else
    // falls back to the greedy scan.
    let mut pairs = if cost.iter().flatten().all(|c| c.is_finite()) {
        hungarian(&cost).into_iter().enumerate().collect()
    } else {
        greedy(&cost)
    };
    pairs.retain(|&(i, j)| i < n && j < m);
    pairs.sort_by(|a, b| cost[a.0][a.1].total_cmp(&cost[b.0][b.1]).then(a.0.cmp(&b.0)));
    pairs
}

/// Min-max normalize the whole matrix to [0, 1]; a flat matrix maps to
/// all zeros.
fn normalize(matrix: &mut [Vec<f64>]) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in matrix.iter().flatten() {
        min = min.min(*value);
        max = max.max(*value);
    }
    let range = max - min;
    for row in matrix.iter_mut() {
        for value in row.iter_mut() {
            *value = if range.abs() < RANGE_EPS {
                0.0
            } else {
                (*value - min) / range
            };
        }
    }
}

/// Kuhn-Munkres with shortest augmenting paths over a dense square
/// matrix. Returns the assigned column for every row.
fn hungarian(cost: &[Vec<f64>]) -> Vec<usize> {
    let k = cost.len();
    let mut u = vec![0.0_f64; k + 1];
    let mut v = vec![0.0_f64; k + 1];
    // p[j] = row matched to column j, 1-based; 0 means unmatched.
    let mut p = vec![0_usize; k + 1];
    let mut way = vec![0_usize; k + 1];

    for i in 1..=k {
        p[0] = i;
        let mut j0 = 0_usize;
        let mut minv = vec![f64::INFINITY; k + 1];
        let mut used = vec![false; k + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0_usize;
            for j in 1..=k {
                if used[j] {
                    continue;
                }
                let reduced = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=k {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assigned = vec![0_usize; k];
    for j in 1..=k {
        if p[j] > 0 {
            assigned[p[j] - 1] = j - 1;
        }
    }
    assigned
}

/// Fallback: scan all cells cheapest-first, taking each row and column at
/// most once.
fn greedy(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let k = cost.len();
    let mut entries: Vec<(f64, usize, usize)> = Vec::with_capacity(k * k);
    for (i, row) in cost.iter().enumerate() {
        for (j, &value) in row.iter().enumerate() {
            entries.push((value, i, j));
        }
    }
    entries.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut row_taken = vec![false; k];
    let mut col_taken = vec![false; k];
    let mut pairs = Vec::with_capacity(k);
    for (_, i, j) in entries {
        if row_taken[i] || col_taken[j] {
            continue;
        }
        row_taken[i] = true;
        col_taken[j] = true;
        pairs.push((i, j));
        if pairs.len() == k {
            break;
        }
    }
    pairs
}
