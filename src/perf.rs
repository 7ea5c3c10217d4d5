//! Block-parallel helpers.
//!
//! Every stage that works on independent units (granularity tables, ECC
//! blocks, Merkle leaves, tree levels) goes through these functions, so the
//! `parallel` feature switches Rayon on or off in one place.
//!
//! # Ordering
//! Output element `i` always corresponds to input element `i`.  Rayon's
//! indexed `collect` preserves order, and the sequential fallback is a
//! plain iterator, so block order is never observed to change downstream.
//!
//! # Errors
//! [`try_map_ordered`] surfaces an error if any unit fails; remaining work
//! is abandoned.  Which error wins when several units fail concurrently is
//! unspecified.

/// Apply `f(index, item)` to every element, in parallel when the
/// `parallel` feature is enabled.
pub fn map_ordered<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        items.par_iter().enumerate().map(|(i, item)| f(i, item)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        items.iter().enumerate().map(|(i, item)| f(i, item)).collect()
    }
}

/// Fallible variant of [`map_ordered`].
pub fn try_map_ordered<T, R, E, F>(items: &[T], f: F) -> Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: Send,
    F: Fn(usize, &T) -> Result<R, E> + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        items.par_iter().enumerate().map(|(i, item)| f(i, item)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        items.iter().enumerate().map(|(i, item)| f(i, item)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_order() {
        let items: Vec<u32> = (0..10_000).collect();
        let out = map_ordered(&items, |i, v| (i as u32) * 2 + v);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as u32 * 3);
        }
    }

    #[test]
    fn try_map_surfaces_error() {
        let items: Vec<u32> = (0..100).collect();
        let res: Result<Vec<u32>, String> = try_map_ordered(&items, |_, v| {
            if *v == 57 { Err(format!("bad {v}")) } else { Ok(*v) }
        });
        assert_eq!(res.unwrap_err(), "bad 57");

        let ok: Result<Vec<u32>, String> = try_map_ordered(&items, |_, v| Ok(v + 1));
        assert_eq!(ok.unwrap()[99], 100);
    }
}
