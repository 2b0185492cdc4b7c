//! Record comparators.

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Strict weak ordering over records, allowed to fail.
///
/// A failure aborts the algorithm using the comparator; it should be reported as
/// [`Error::Comparator`]. Sentinels are optional: when present they must strictly bound every
/// key the comparator will see.
pub trait Comparator<T>: Sync {
    fn compare(&self, a: &T, b: &T) -> Result<Ordering>;

    /// Value smaller than every key.
    fn min_value(&self) -> Option<T> {
        None
    }

    /// Value greater than every key.
    fn max_value(&self) -> Option<T> {
        None
    }
}

impl<T, C: Comparator<T> + ?Sized> Comparator<T> for &C {
    fn compare(&self, a: &T, b: &T) -> Result<Ordering> {
        (**self).compare(a, b)
    }

    fn min_value(&self) -> Option<T> {
        (**self).min_value()
    }

    fn max_value(&self) -> Option<T> {
        (**self).max_value()
    }
}

/// Ordering given by [`Ord`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Natural;

impl<T: Ord> Comparator<T> for Natural {
    fn compare(&self, a: &T, b: &T) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

/// Infallible compare function.
#[derive(Clone, Copy)]
pub struct CompareFn<F>(pub F);

impl<T, F> Comparator<T> for CompareFn<F>
where
    F: Fn(&T, &T) -> Ordering + Sync,
{
    fn compare(&self, a: &T, b: &T) -> Result<Ordering> {
        Ok((self.0)(a, b))
    }
}

/// Comparator carrying explicit sentinels.
#[derive(Clone)]
pub struct Bounded<C, T> {
    inner: C,
    min: T,
    max: T,
}

impl<C, T> Bounded<C, T> {
    pub fn new(inner: C, min: T, max: T) -> Self {
        Bounded { inner, min, max }
    }
}

impl<C, T> Comparator<T> for Bounded<C, T>
where
    C: Comparator<T>,
    T: Clone + Sync,
{
    fn compare(&self, a: &T, b: &T) -> Result<Ordering> {
        self.inner.compare(a, b)
    }

    fn min_value(&self) -> Option<T> {
        Some(self.min.clone())
    }

    fn max_value(&self) -> Option<T> {
        Some(self.max.clone())
    }
}

/// Sentinels are either both absent or both present with `min < max`.
pub(crate) fn check_sentinels<T, C: Comparator<T>>(cmp: &C) -> Result<()> {
    match (cmp.min_value(), cmp.max_value()) {
        (None, None) => Ok(()),
        (Some(min), Some(max)) => match cmp.compare(&min, &max)? {
            Ordering::Less => Ok(()),
            _ => Err(Error::BadParameter("min_value() must be less than max_value()".to_string())),
        },
        _ => Err(Error::BadParameter(
            "comparator defines only one of min_value() and max_value()".to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rstest::*;

    use super::{check_sentinels, Bounded, CompareFn, Comparator, Natural};
    use crate::error::Result;

    struct OnlyMin;

    impl Comparator<u32> for OnlyMin {
        fn compare(&self, a: &u32, b: &u32) -> Result<Ordering> {
            Ok(a.cmp(b))
        }

        fn min_value(&self) -> Option<u32> {
            Some(0)
        }
    }

    #[rstest]
    #[case(1, 2, Ordering::Less)]
    #[case(2, 2, Ordering::Equal)]
    #[case(3, 2, Ordering::Greater)]
    fn test_comparators_agree(#[case] a: u32, #[case] b: u32, #[case] expected: Ordering) {
        assert_eq!(Natural.compare(&a, &b).unwrap(), expected);
        assert_eq!(CompareFn(|x: &u32, y: &u32| y.cmp(x)).compare(&a, &b).unwrap(), expected.reverse());
        assert_eq!((&Natural).compare(&a, &b).unwrap(), expected);
    }

    #[test]
    fn test_sentinels() {
        assert!(check_sentinels::<u32, _>(&Natural).is_ok());
        assert!(check_sentinels(&Bounded::new(Natural, 0u32, u32::MAX)).is_ok());
        assert!(check_sentinels(&Bounded::new(Natural, 5u32, 5)).is_err());
        assert!(check_sentinels(&OnlyMin).is_err());
    }
}
