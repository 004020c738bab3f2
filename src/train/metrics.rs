use std::fmt;

use serde::{Deserialize, Serialize};

use crate::matrix::{argmax, EPSILON};
use crate::types::{Emotion, NUM_EMOTIONS};

/// Mean categorical cross-entropy against one-hot labels.
pub fn cross_entropy(probabilities: &[Vec<f64>], labels: &[Emotion]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let total: f64 = probabilities
        .iter()
        .zip(labels)
        .map(|(p, label)| -p[label.index()].max(EPSILON).ln())
        .sum();
    total / labels.len() as f64
}

/// Arg-max emotion per distribution.
pub fn predicted_labels(probabilities: &[Vec<f64>]) -> Vec<Emotion> {
    probabilities
        .iter()
        .map(|p| Emotion::ALL[argmax(p)])
        .collect()
}

/// Rows are true emotions, columns predicted, both in vocabulary order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl Default for ConfusionMatrix {
    fn default() -> Self {
        Self {
            counts: vec![vec![0; NUM_EMOTIONS]; NUM_EMOTIONS],
        }
    }
}

impl ConfusionMatrix {
    pub fn from_predictions(actual: &[Emotion], predicted: &[Emotion]) -> Self {
        let mut matrix = Self::default();
        for (&a, &p) in actual.iter().zip(predicted) {
            matrix.record(a, p);
        }
        matrix
    }

    pub fn record(&mut self, actual: Emotion, predicted: Emotion) {
        self.counts[actual.index()][predicted.index()] += 1;
    }

    pub fn count(&self, actual: Emotion, predicted: Emotion) -> usize {
        self.counts[actual.index()][predicted.index()]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Samples whose true label is `emotion`.
    pub fn support(&self, emotion: Emotion) -> usize {
        self.counts[emotion.index()].iter().sum()
    }

    /// Samples predicted as `emotion`.
    pub fn predicted(&self, emotion: Emotion) -> usize {
        self.counts.iter().map(|row| row[emotion.index()]).sum()
    }

    pub fn correct(&self) -> usize {
        (0..NUM_EMOTIONS).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.correct() as f64 / total as f64
        }
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>10}", "")?;
        for e in Emotion::ALL {
            write!(f, "{:>9}", e.as_str())?;
        }
        writeln!(f)?;
        for (e, row) in Emotion::ALL.iter().zip(&self.counts) {
            write!(f, "{:>10}", e.as_str())?;
            for n in row {
                write!(f, "{n:>9}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub emotion: Emotion,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision/recall/F1 plus macro and weighted averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub weighted_f1: f64,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ClassificationReport {
    pub fn from_confusion(confusion: &ConfusionMatrix) -> Self {
        let classes: Vec<ClassMetrics> = Emotion::ALL
            .iter()
            .map(|&emotion| {
                let tp = confusion.count(emotion, emotion);
                let precision = ratio(tp, confusion.predicted(emotion));
                let recall = ratio(tp, confusion.support(emotion));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    emotion,
                    precision,
                    recall,
                    f1,
                    support: confusion.support(emotion),
                }
            })
            .collect();

        // classes never seen nor predicted do not count towards the macro average
        let present: Vec<&ClassMetrics> = classes
            .iter()
            .filter(|c| c.support > 0 || confusion.predicted(c.emotion) > 0)
            .collect();
        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if present.is_empty() {
                0.0
            } else {
                present.iter().map(|c| f(c)).sum::<f64>() / present.len() as f64
            }
        };
        let total = confusion.total();
        let weighted_f1 = if total == 0 {
            0.0
        } else {
            classes
                .iter()
                .map(|c| c.f1 * c.support as f64)
                .sum::<f64>()
                / total as f64
        };

        Self {
            accuracy: confusion.accuracy(),
            macro_precision: macro_avg(|c| c.precision),
            macro_recall: macro_avg(|c| c.recall),
            macro_f1: macro_avg(|c| c.f1),
            weighted_f1,
            classes,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>10} {:>10} {:>10} {:>10} {:>10}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>10} {:>10.4} {:>10.4} {:>10.4} {:>10}",
                c.emotion.as_str(),
                c.precision,
                c.recall,
                c.f1,
                c.support
            )?;
        }
        writeln!(f, "{:>10} {:>32.4}", "accuracy", self.accuracy)?;
        write!(
            f,
            "{:>10} {:>10.4} {:>10.4} {:>10.4}",
            "macro avg", self.macro_precision, self.macro_recall, self.macro_f1
        )
    }
}

/// Metrics of one split, computed from predicted distributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub report: ClassificationReport,
    pub confusion: ConfusionMatrix,
}

impl EvaluationReport {
    pub fn compute(probabilities: &[Vec<f64>], labels: &[Emotion]) -> Self {
        let predicted = predicted_labels(probabilities);
        let confusion = ConfusionMatrix::from_predictions(labels, &predicted);
        let report = ClassificationReport::from_confusion(&confusion);
        Self {
            loss: cross_entropy(probabilities, labels),
            accuracy: report.accuracy,
            precision: report.macro_precision,
            recall: report.macro_recall,
            report,
            confusion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(e: Emotion, p: f64) -> Vec<f64> {
        let rest = (1.0 - p) / (NUM_EMOTIONS - 1) as f64;
        let mut v = vec![rest; NUM_EMOTIONS];
        v[e.index()] = p;
        v
    }

    #[test]
    fn test_cross_entropy_of_confident_predictions() {
        let probs = vec![one_hot(Emotion::Happy, 1.0), one_hot(Emotion::Sad, 0.5)];
        let loss = cross_entropy(&probs, &[Emotion::Happy, Emotion::Sad]);
        assert!((loss - 0.5 * 2f64.ln()).abs() < 1e-12);
        assert_eq!(cross_entropy(&[], &[]), 0.0);
    }

    #[test]
    fn test_confusion_and_report() {
        use Emotion::*;
        let actual = [Happy, Happy, Sad, Sad, Angry];
        let predicted = [Happy, Sad, Sad, Sad, Happy];
        let confusion = ConfusionMatrix::from_predictions(&actual, &predicted);
        assert_eq!(confusion.total(), 5);
        assert_eq!(confusion.count(Happy, Sad), 1);
        assert_eq!(confusion.correct(), 3);

        let report = ClassificationReport::from_confusion(&confusion);
        assert!((report.accuracy - 0.6).abs() < 1e-12);
        let happy = &report.classes[Happy.index()];
        assert!((happy.precision - 0.5).abs() < 1e-12);
        assert!((happy.recall - 0.5).abs() < 1e-12);
        let sad = &report.classes[Sad.index()];
        assert!((sad.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((sad.recall - 1.0).abs() < 1e-12);
        // happy, sad, angry present; angry scores zero
        assert!((report.macro_precision - (0.5 + 2.0 / 3.0) / 3.0).abs() < 1e-12);
        assert!((report.macro_recall - 1.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_evaluation_report_uses_argmax() {
        let probs = vec![one_hot(Emotion::Fear, 0.4), one_hot(Emotion::Disgust, 0.9)];
        let report = EvaluationReport::compute(&probs, &[Emotion::Fear, Emotion::Neutral]);
        assert!((report.accuracy - 0.5).abs() < 1e-12);
        assert_eq!(report.confusion.count(Emotion::Neutral, Emotion::Disgust), 1);
        assert!(report.report.to_string().contains("fear"));
    }
}
