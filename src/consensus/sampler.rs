use rand::{Rng, seq::index};

/// Draws the reading indices of each consensus trial.
pub trait Sampler {
    fn subset_size(&self) -> usize;

    /// Returns the indices of the next subset. Indices are distinct.
    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<usize>;
}

/// Draws subsets uniformly among all readings.
#[derive(Clone, Debug)]
pub struct UniformSampler {
    len: usize,
    size: usize,
}

impl UniformSampler {
    /// Panics on sampling if `size` exceeds `len`.
    pub fn new(len: usize, size: usize) -> Self {
        Self { len, size }
    }
}

impl Sampler for UniformSampler {
    fn subset_size(&self) -> usize {
        self.size
    }

    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<usize> {
        index::sample(rng, self.len, self.size).into_vec()
    }
}

/// Draws subsets from a pool of the best rated readings that grows with the
/// number of trials.
///
/// The first subset is made of the best rated readings. Afterwards each
/// subset holds the newest reading of the pool and the rest is drawn from the
/// readings rated above it, until the pool has been sampled as often as the
/// growth function allows and the next reading joins it.
#[derive(Clone, Debug)]
pub struct ProgressiveSampler {
    /// Reading indices by decreasing quality.
    order: Vec<usize>,
    size: usize,
    pool: usize,
    iteration: usize,

    /// Expected number of trials drawn from the current pool.
    growth: f64,

    /// Trial at which the pool grows.
    growth_limit: usize,
}

impl ProgressiveSampler {
    /// The pool holds every reading once `max_samples` subsets have been
    /// drawn. Panics on sampling if `size` exceeds the number of scores.
    pub fn new(quality: &[f64], size: usize, max_samples: usize) -> Self {
        let mut order: Vec<usize> = (0..quality.len()).collect();
        order.sort_by(|a, b| quality[*b].total_cmp(&quality[*a]));

        let len = quality.len();
        let growth = (0..size.min(len)).fold(max_samples as f64, |growth, i| {
            growth * (size - i) as f64 / (len - i) as f64
        });

        Self {
            order,
            size,
            pool: size,
            iteration: 0,
            growth,
            growth_limit: 1,
        }
    }

    /// Number of best rated readings subsets are currently drawn from.
    pub fn pool(&self) -> usize {
        self.pool
    }
}

impl Sampler for ProgressiveSampler {
    fn subset_size(&self) -> usize {
        self.size
    }

    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<usize> {
        self.iteration += 1;
        if self.iteration > self.growth_limit && self.pool < self.order.len() {
            let next = self.growth * (self.pool + 1) as f64 / (self.pool + 1 - self.size) as f64;
            self.growth_limit += (next - self.growth).ceil() as usize;
            self.growth = next;
            self.pool += 1;
        }

        match self.growth_limit >= self.iteration {
            true => {
                let mut subset: Vec<usize> = index::sample(rng, self.pool - 1, self.size - 1)
                    .into_iter()
                    .map(|i| self.order[i])
                    .collect();
                subset.push(self.order[self.pool - 1]);
                subset
            }
            false => index::sample(rng, self.pool, self.size)
                .into_iter()
                .map(|i| self.order[i])
                .collect(),
        }
    }
}
