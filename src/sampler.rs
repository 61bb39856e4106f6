//! Stateful temperature sampling.
//!
//! A [`SamplingSession`] primes the model with the seed, then repeatedly
//! samples one character from the temperature-scaled distribution over the
//! last timestep's logits and feeds *only that character* back in together
//! with the carried hidden state. The state encodes all earlier history, so
//! each step costs one timestep regardless of how much text came before.
//!
//! ```text
//! AwaitingSeed -> ValidatingSeed -> Generating(1..=length) -> Done
//! ```
//!
//! Sessions own their hidden state and borrow the model immutably; dropping
//! a session early abandons the remaining steps with nothing to undo.

use ndarray::{Array2, ArrayView1, Axis};
use rand::Rng;

use crate::core::{HiddenState, Recurrent, RnnError, RnnResult};
use crate::data::Vocabulary;
use crate::events::EventSink;
use crate::utils::softmax;

fn check_temperature(temperature: f32) -> RnnResult<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(RnnError::InvalidTemperature(temperature))
    }
}

/// Draw an index from `softmax(logits / temperature)`.
///
/// Builds the cumulative distribution and locates one uniform draw in it.
///
/// # Errors
/// `InvalidTemperature` unless `temperature` is finite and > 0,
/// `ShapeMismatch` for empty logits, `InvalidConfig` for non-finite logits.
pub fn sample_categorical<R: Rng + ?Sized>(
    logits: ArrayView1<f32>,
    temperature: f32,
    rng: &mut R,
) -> RnnResult<usize> {
    check_temperature(temperature)?;
    if logits.is_empty() {
        return Err(RnnError::ShapeMismatch("cannot sample from empty logits".to_string()));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(RnnError::InvalidConfig("logits contain non-finite values".to_string()));
    }

    // shift before scaling so the top logit stays at 0 for tiny temperatures
    let max = logits.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let probs = softmax(logits.mapv(|l| (l - max) / temperature).view());
    let u: f32 = rng.gen();
    let mut cumulative = 0.0;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i;
        }
        cumulative += p;
        if u < cumulative {
            return Ok(i);
        }
    }
    // rounding left the total just under 1
    Ok(last_nonzero)
}

/// Generates text from a model and the vocabulary it was trained with.
pub struct TextSampler<'a, M: Recurrent + ?Sized> {
    model: &'a M,
    vocab: &'a Vocabulary,
    temperature: f32,
    sink: &'a dyn EventSink,
}

impl<'a, M: Recurrent + ?Sized> TextSampler<'a, M> {
    /// # Errors
    /// `InvalidTemperature` for a temperature that is not finite and > 0,
    /// `ShapeMismatch` when the model's output size differs from the
    /// vocabulary size, `InvalidConfig` for an empty vocabulary.
    pub fn new(
        model: &'a M,
        vocab: &'a Vocabulary,
        temperature: f32,
        sink: &'a dyn EventSink,
    ) -> RnnResult<Self> {
        check_temperature(temperature)?;
        if vocab.is_empty() {
            return Err(RnnError::InvalidConfig("vocabulary is empty".to_string()));
        }
        if model.vocab_size() != vocab.size() {
            return Err(RnnError::ShapeMismatch(format!(
                "model emits {} logits but vocabulary has {} characters",
                model.vocab_size(),
                vocab.size()
            )));
        }
        Ok(Self {
            model,
            vocab,
            temperature,
            sink,
        })
    }

    #[must_use]
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Start a session from `seed`.
    ///
    /// If any seed character is outside the vocabulary, or the seed is
    /// empty, the whole seed is replaced by one uniformly drawn vocabulary
    /// character and a warning is emitted.
    pub fn session<'s, R: Rng + ?Sized>(
        &'s self,
        seed: &str,
        rng: &'s mut R,
    ) -> SamplingSession<'s, M, R> {
        let (seed, pending) = match self.vocab.encode(seed) {
            Ok(indices) if !indices.is_empty() => (seed.to_string(), indices),
            _ => {
                let idx = rng.gen_range(0..self.vocab.size());
                let replacement = self.vocab.chars()[idx];
                self.sink.warn(&format!(
                    "seed {seed:?} is not covered by the vocabulary; using {replacement:?} instead"
                ));
                (replacement.to_string(), vec![idx])
            }
        };
        SamplingSession {
            model: self.model,
            vocab: self.vocab,
            temperature: self.temperature,
            rng,
            state: None,
            pending,
            seed,
            steps: 0,
            failed: false,
        }
    }

    /// Seed (after any fallback) followed by `length` sampled characters.
    ///
    /// # Errors
    /// Propagates model errors from any step.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        seed: &str,
        length: usize,
        rng: &mut R,
    ) -> RnnResult<String> {
        let mut session = self.session(seed, rng);
        let mut out = session.seed().to_string();
        for c in session.by_ref().take(length) {
            out.push(c?);
        }
        Ok(out)
    }
}

/// One in-flight generation. Yields one sampled character per step.
pub struct SamplingSession<'s, M: Recurrent + ?Sized, R: Rng + ?Sized> {
    model: &'s M,
    vocab: &'s Vocabulary,
    temperature: f32,
    rng: &'s mut R,
    state: Option<HiddenState>,
    /// Indices to feed on the next step: the seed first, then the newest character.
    pending: Vec<usize>,
    seed: String,
    steps: usize,
    failed: bool,
}

impl<M: Recurrent + ?Sized, R: Rng + ?Sized> SamplingSession<'_, M, R> {
    /// The seed actually used.
    #[must_use]
    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Characters generated so far.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn step(&mut self) -> RnnResult<char> {
        let inputs = Array2::from_shape_vec((1, self.pending.len()), self.pending.clone())
            .map_err(|e| RnnError::ShapeMismatch(e.to_string()))?;
        let (logits, state) = self.model.forward_infer(&inputs, self.state.take())?;
        let expected = (1, self.pending.len(), self.vocab.size());
        if logits.dim() != expected {
            return Err(RnnError::ShapeMismatch(format!(
                "model returned logits of shape {:?}, expected {expected:?}",
                logits.dim()
            )));
        }
        let last = logits.index_axis(Axis(0), 0);
        let last = last.index_axis(Axis(0), self.pending.len() - 1);
        let idx = sample_categorical(last, self.temperature, &mut *self.rng)?;
        let c = self.vocab.index_to_char(idx).ok_or_else(|| {
            RnnError::ShapeMismatch(format!("sampled index {idx} outside vocabulary"))
        })?;

        self.state = Some(state);
        self.pending.clear();
        self.pending.push(idx);
        self.steps += 1;
        Ok(c)
    }
}

impl<M: Recurrent + ?Sized, R: Rng + ?Sized> Iterator for SamplingSession<'_, M, R> {
    type Item = RnnResult<char>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.step();
        self.failed = result.is_err();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ModelConfig, SequenceModel};
    use crate::events::{Level, MemorySink, NullSink};
    use crate::utils::entropy;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Highest logit on `(input + 1) % vocab` at every step.
    struct CycleModel {
        vocab: usize,
    }

    impl Recurrent for CycleModel {
        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn forward_infer(
            &self,
            inputs: &Array2<usize>,
            _state: Option<HiddenState>,
        ) -> RnnResult<(Array3<f32>, HiddenState)> {
            let (b, t) = inputs.dim();
            let mut logits = Array3::zeros((b, t, self.vocab));
            for ((i, j), &x) in inputs.indexed_iter() {
                logits[[i, j, (x + 1) % self.vocab]] = 10.0;
            }
            Ok((logits, HiddenState::zeros(b, 1)))
        }
    }

    /// State counts every timestep seen; the favoured output is `count % vocab`.
    struct CountingModel {
        vocab: usize,
    }

    impl Recurrent for CountingModel {
        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn forward_infer(
            &self,
            inputs: &Array2<usize>,
            state: Option<HiddenState>,
        ) -> RnnResult<(Array3<f32>, HiddenState)> {
            let (b, t) = inputs.dim();
            let mut count = state.map_or(0.0, |s| s.as_array()[[0, 0]]);
            let mut logits = Array3::zeros((b, t, self.vocab));
            for j in 0..t {
                count += 1.0;
                logits[[0, j, count as usize % self.vocab]] = 20.0;
            }
            Ok((logits, HiddenState::from_array(Array2::from_elem((b, 1), count))))
        }
    }

    /// Always answers with a single timestep, whatever it was fed.
    struct OneStepModel {
        vocab: usize,
    }

    impl Recurrent for OneStepModel {
        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn forward_infer(
            &self,
            inputs: &Array2<usize>,
            _state: Option<HiddenState>,
        ) -> RnnResult<(Array3<f32>, HiddenState)> {
            let b = inputs.nrows();
            Ok((Array3::zeros((b, 1, self.vocab)), HiddenState::zeros(b, 1)))
        }
    }

    fn abc() -> Vocabulary {
        Vocabulary::from_text("abc")
    }

    #[test]
    fn test_low_temperature_walk() {
        let vocab = abc();
        let model = CycleModel { vocab: 3 };
        let sampler = TextSampler::new(&model, &vocab, 0.01, &NullSink).unwrap();
        let out = sampler.generate("a", 3, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out, "abca");
    }

    #[test]
    fn test_only_newest_character_is_fed_forward() {
        let vocab = abc();
        let model = CountingModel { vocab: 3 };
        let sampler = TextSampler::new(&model, &vocab, 0.01, &NullSink).unwrap();
        // "ab" primes 2 steps -> 'c', then one step per generated character
        let out = sampler.generate("ab", 3, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out, "abcab");
    }

    #[test]
    fn test_output_length() {
        let text = "the quick brown fox jumps over the lazy dog";
        let vocab = Vocabulary::from_text(text);
        let mut rng = StdRng::seed_from_u64(11);
        let model = SequenceModel::new(
            ModelConfig {
                vocab_size: vocab.size(),
                embedding_dim: 8,
                rnn_hidden_units: 12,
            },
            &mut rng,
        )
        .unwrap();
        let sampler = TextSampler::new(&model, &vocab, 1.0, &NullSink).unwrap();
        for length in [0, 1, 25] {
            let out = sampler.generate("the ", length, &mut rng).unwrap();
            assert_eq!(out.chars().count(), 4 + length);
            assert!(out.starts_with("the "));
            assert!(vocab.contains_all(&out));
        }
    }

    #[test]
    fn test_seed_fallback_replaces_whole_seed() {
        let vocab = abc();
        let model = CycleModel { vocab: 3 };
        let sink = MemorySink::new();
        let sampler = TextSampler::new(&model, &vocab, 0.5, &sink).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let out = sampler.generate("abz", 5, &mut rng).unwrap();
        assert_eq!(out.chars().count(), 6);
        assert!(vocab.contains_all(&out));
        assert_eq!(sink.at_level(Level::Warn).len(), 1);

        let session = sampler.session("", &mut rng);
        assert_eq!(session.seed().chars().count(), 1);
        assert_eq!(sink.at_level(Level::Warn).len(), 2);
    }

    #[test]
    fn test_valid_seed_emits_no_warning() {
        let vocab = abc();
        let model = CycleModel { vocab: 3 };
        let sink = MemorySink::new();
        let sampler = TextSampler::new(&model, &vocab, 1.0, &sink).unwrap();
        sampler.generate("cab", 4, &mut StdRng::seed_from_u64(0)).unwrap();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let vocab = abc();
        let model = CycleModel { vocab: 3 };
        for t in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                TextSampler::new(&model, &vocab, t, &NullSink),
                Err(RnnError::InvalidTemperature(_))
            ));
        }
    }

    #[test]
    fn test_vocab_size_mismatch_rejected() {
        let vocab = abc();
        let model = CycleModel { vocab: 4 };
        assert!(matches!(
            TextSampler::new(&model, &vocab, 1.0, &NullSink),
            Err(RnnError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_sample_categorical_frequencies() {
        let probs = [0.2f32, 0.3, 0.5];
        let logits = array![probs[0].ln(), probs[1].ln(), probs[2].ln()];
        let mut rng = StdRng::seed_from_u64(5);
        let mut counts = [0usize; 3];
        let n = 20_000;
        for _ in 0..n {
            counts[sample_categorical(logits.view(), 1.0, &mut rng).unwrap()] += 1;
        }
        for (c, p) in counts.iter().zip(probs) {
            assert_abs_diff_eq!(*c as f32 / n as f32, p, epsilon = 0.02);
        }
    }

    #[test]
    fn test_temperature_controls_entropy() {
        let logits = array![2.0f32, 1.0, 0.5, 0.0];
        let mut rng = StdRng::seed_from_u64(9);
        let mut draw = |t: f32| {
            let mut counts = [0usize; 4];
            for _ in 0..4000 {
                counts[sample_categorical(logits.view(), t, &mut rng).unwrap()] += 1;
            }
            counts
        };
        let cold = draw(0.05);
        let hot = draw(2.0);
        assert!(cold[0] > 3990);
        assert!(entropy(&hot) > entropy(&cold) + 0.5);
    }

    #[test]
    fn test_sample_categorical_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        let empty = ndarray::Array1::<f32>::zeros(0);
        assert!(sample_categorical(empty.view(), 1.0, &mut rng).is_err());
        assert!(sample_categorical(array![0.0, f32::NAN].view(), 1.0, &mut rng).is_err());
        assert!(sample_categorical(array![0.0, 1.0].view(), 0.0, &mut rng).is_err());
    }

    #[test]
    fn test_tiny_temperature_picks_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        for t in [1e-3, 1e-30, 1e-38, f32::MIN_POSITIVE] {
            for _ in 0..20 {
                let idx = sample_categorical(array![0.0, 5.0, 1.0].view(), t, &mut rng).unwrap();
                assert_eq!(idx, 1, "temperature {t}");
            }
        }
    }

    #[test]
    fn test_misshapen_logits_are_an_error() {
        let vocab = abc();
        let model = OneStepModel { vocab: 3 };
        let sampler = TextSampler::new(&model, &vocab, 1.0, &NullSink).unwrap();
        // a single-character seed matches the one timestep returned
        assert!(sampler.generate("a", 2, &mut StdRng::seed_from_u64(0)).is_ok());
        assert!(matches!(
            sampler.generate("abc", 2, &mut StdRng::seed_from_u64(0)),
            Err(RnnError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let vocab = Vocabulary::from_text("abcdefg ");
        let model = SequenceModel::new(
            ModelConfig {
                vocab_size: vocab.size(),
                embedding_dim: 4,
                rnn_hidden_units: 6,
            },
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
        let sampler = TextSampler::new(&model, &vocab, 1.0, &NullSink).unwrap();
        let a = sampler.generate("ab", 30, &mut StdRng::seed_from_u64(77)).unwrap();
        let b = sampler.generate("ab", 30, &mut StdRng::seed_from_u64(77)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_concurrent_sessions_share_model() {
        let vocab = Vocabulary::from_text("hello world");
        let model = SequenceModel::new(
            ModelConfig {
                vocab_size: vocab.size(),
                embedding_dim: 4,
                rnn_hidden_units: 8,
            },
            &mut StdRng::seed_from_u64(2),
        )
        .unwrap();
        let sampler = TextSampler::new(&model, &vocab, 0.8, &NullSink).unwrap();
        let outputs: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4u64)
                .map(|i| {
                    let sampler = &sampler;
                    scope.spawn(move || {
                        sampler
                            .generate("he", 20, &mut StdRng::seed_from_u64(i))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (i, out) in outputs.iter().enumerate() {
            let expected = sampler
                .generate("he", 20, &mut StdRng::seed_from_u64(i as u64))
                .unwrap();
            assert_eq!(out, &expected);
        }
    }

    #[test]
    fn test_session_can_be_abandoned() {
        let vocab = abc();
        let model = CycleModel { vocab: 3 };
        let sampler = TextSampler::new(&model, &vocab, 0.01, &NullSink).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let mut session = sampler.session("b", &mut rng);
        let first: String = session.by_ref().take(2).map(Result::unwrap).collect();
        assert_eq!(first, "ca");
        assert_eq!(session.steps(), 2);
        drop(session);
        assert_eq!(sampler.generate("b", 2, &mut rng).unwrap(), "bca");
    }
}
