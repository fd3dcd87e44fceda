use std::cmp::Ordering;

use crate::error::RankError;
use crate::types::{Prediction, RankedEntry, RankedResult};

/// Orders a prediction's labels by probability, highest first. Labels with
/// equal probability keep the order the server listed them in.
pub fn rank(prediction: &Prediction) -> Result<RankedResult, RankError> {
    let mut entries = prediction
        .class_dictionary
        .iter()
        .map(|(label, index)| match prediction.probabilities.get(*index) {
            Some(&probability) => Ok(RankedEntry {
                label: label.clone(),
                probability,
            }),
            None => Err(RankError::IndexOutOfRange {
                label: label.clone(),
                index: *index,
                len: prediction.probabilities.len(),
            }),
        })
        .collect::<Result<Vec<_>, RankError>>()?;

    // sort_by is stable
    entries.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(Ordering::Equal)
    });

    Ok(RankedResult::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(probabilities: &[f64], dictionary: &[(&str, usize)]) -> Prediction {
        Prediction {
            class_name: dictionary.first().map(|(l, _)| l.to_string()).unwrap_or_default(),
            probabilities: probabilities.to_vec(),
            class_dictionary: dictionary
                .iter()
                .map(|(label, index)| (label.to_string(), *index))
                .collect(),
        }
    }

    fn labels(ranked: &RankedResult) -> Vec<&str> {
        ranked.entries().iter().map(|e| e.label.as_str()).collect()
    }

    #[test]
    fn orders_by_probability_descending() {
        let p = prediction(
            &[70.0, 10.0, 5.0, 10.0, 5.0],
            &[
                ("messi", 0),
                ("virat", 1),
                ("serena", 2),
                ("roger", 3),
                ("sharapova", 4),
            ],
        );
        let ranked = rank(&p).unwrap();

        assert_eq!(
            ranked.entries()[0],
            RankedEntry {
                label: "messi".into(),
                probability: 70.0
            }
        );
        // ties keep dictionary order
        assert_eq!(labels(&ranked), ["messi", "virat", "roger", "serena", "sharapova"]);
    }

    #[test]
    fn dictionary_order_decides_ties_not_index_order() {
        let p = prediction(&[20.0, 20.0, 60.0], &[("b", 1), ("a", 0), ("c", 2)]);
        assert_eq!(labels(&rank(&p).unwrap()), ["c", "b", "a"]);
    }

    #[test]
    fn ranking_is_idempotent() {
        let p = prediction(&[33.3, 33.3, 33.4], &[("x", 0), ("y", 1), ("z", 2)]);
        assert_eq!(rank(&p).unwrap(), rank(&p).unwrap());
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let p = prediction(&[90.0, 10.0], &[("messi", 0), ("roger", 2)]);
        assert_eq!(
            rank(&p).unwrap_err(),
            RankError::IndexOutOfRange {
                label: "roger".into(),
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn empty_dictionary_ranks_to_empty_result() {
        let p = prediction(&[100.0], &[]);
        assert!(rank(&p).unwrap().is_empty());
    }
}
