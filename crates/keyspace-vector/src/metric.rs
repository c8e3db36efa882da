//! Distance metrics shared by the flat and HNSW vector indexes.
//!
//! Every metric is normalized to "lower is better" so both indexes can
//! share one bounded max-heap for top-k selection: cosine and dot-product
//! similarity are negated, Euclidean distance is used as-is.

/// A vector similarity metric, normalized so a smaller returned value is
/// always a closer match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Euclidean,
    Cosine,
    DotProduct,
}

/// Compute the normalized distance between two equal-length vectors. The
/// caller is responsible for dimension-checking beforehand
/// (`Error::DimensionMismatch`); this function assumes `a.len() ==
/// b.len()`.
pub fn distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
        DistanceMetric::DotProduct => -dot(a, b),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        0.0
    } else {
        dot(a, b) / denom
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn euclidean_distance_of_identical_vectors_is_zero() {
        assert_eq!(distance(&[1.0, 2.0], &[1.0, 2.0], DistanceMetric::Euclidean), 0.0);
    }

    #[test]
    fn cosine_distance_of_parallel_vectors_is_zero() {
        let d = distance(&[1.0, 0.0], &[2.0, 0.0], DistanceMetric::Cosine);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_of_orthogonal_vectors_is_one() {
        let d = distance(&[1.0, 0.0], &[0.0, 1.0], DistanceMetric::Cosine);
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dot_product_distance_is_negative_of_dot() {
        let d = distance(&[1.0, 2.0], &[3.0, 4.0], DistanceMetric::DotProduct);
        assert_eq!(d, -11.0);
    }

    #[test]
    fn cosine_distance_against_zero_vector_is_neutral() {
        let d = distance(&[0.0, 0.0], &[1.0, 1.0], DistanceMetric::Cosine);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn closer_vector_has_smaller_euclidean_distance() {
        let near = distance(&[0.0], &[0.1], DistanceMetric::Euclidean);
        let far = distance(&[0.0], &[5.0], DistanceMetric::Euclidean);
        assert!(near < far);
    }
}
