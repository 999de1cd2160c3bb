use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChoiceError {
    #[error("cannot choose from an empty choice set")]
    Empty,
    #[error("choice weights sum to zero")]
    ZeroWeight,
}

/// One entry of a weighted choice list.
#[derive(Debug, Clone)]
pub struct WeightedChoice<T> {
    pub item: T,
    pub weight: u32,
}

impl<T> WeightedChoice<T> {
    pub fn new(item: T, weight: u32) -> Self {
        Self { item, weight }
    }
}

/// Pick one item with probability `weight / total`.
///
/// Exactly one value is drawn from `rng` on every successful call, including
/// when the list holds a single item, so that entities seeded alike stay on
/// the same random sequence regardless of how their action lists are shaped.
pub fn choose<'a, T, R>(choices: &'a [WeightedChoice<T>], rng: &mut R) -> Result<&'a T, ChoiceError>
where
    R: Rng,
{
    if choices.is_empty() {
        return Err(ChoiceError::Empty);
    }

    let total: u64 = choices.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return Err(ChoiceError::ZeroWeight);
    }

    let mut remaining = rng.random_range(0..total);
    for choice in choices {
        let weight = u64::from(choice.weight);
        if remaining < weight {
            return Ok(&choice.item);
        }
        remaining -= weight;
    }

    // remaining < total, so the walk always returns above
    Err(ChoiceError::ZeroWeight)
}
