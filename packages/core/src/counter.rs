use num_traits::{Bounded, One, Unsigned, WrappingAdd};

/// A counter that starts at 1 and wraps back to 1 after surpassing the maximum
/// value of its type (or the specified maximum). Zero is never handed out, so
/// the value can double as a "none" sentinel on the wire, e.g. for callback IDs.
pub struct WrappingCounter<T>
where
    T: Bounded + Ord + Unsigned + WrappingAdd + One + Copy,
{
    value: T,
    max: Option<T>,
}

impl<T> Default for WrappingCounter<T>
where
    T: Bounded + Ord + Unsigned + WrappingAdd + One + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WrappingCounter<T>
where
    T: Bounded + Ord + Unsigned + WrappingAdd + One + Copy,
{
    pub fn new() -> Self {
        Self {
            value: T::zero(),
            max: None,
        }
    }

    pub fn new_with_max(max: T) -> Self {
        Self {
            value: T::zero(),
            max: Some(max),
        }
    }

    pub fn increment(&mut self) -> T {
        let mut next = self.value.wrapping_add(&T::one());
        next = match self.max {
            Some(max) if next > max => T::one(),
            _ => next,
        };
        if next.is_zero() {
            next = T::one();
        }

        self.value = next;
        self.value
    }
}

#[test]
fn test_increment() {
    let mut counter = WrappingCounter::new_with_max(3u8);
    assert_eq!(counter.increment(), 1);
    assert_eq!(counter.increment(), 2);
    assert_eq!(counter.increment(), 3);
    assert_eq!(counter.increment(), 1);
}

#[test]
fn test_wraps_past_zero() {
    let mut counter: WrappingCounter<u8> = WrappingCounter::new();
    for _ in 0..255 {
        counter.increment();
    }
    assert_eq!(counter.increment(), 1);
}
