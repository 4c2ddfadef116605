//! Sentence payloads for the demo producer.

use event_stream::{Payload, PayloadSource};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

pub const SENTENCES: [&str; 10] = [
    "The quick brown fox jumps over the lazy dog.",
    "Kafka is a powerful tool for real-time streaming.",
    "Python makes data processing so much easier.",
    "Streaming data can help you understand patterns in real-time.",
    "I love building scalable systems using Kafka!",
    "Message processing is a crucial part of any streaming system.",
    "Real-time analytics can transform business decision-making.",
    "Data pipelines are essential for modern data architectures.",
    "Machine learning and real-time data go hand in hand.",
    "Big data and real-time processing are shaping the future.",
];

/// Picks a random sentence on every call. Never exhausted.
pub struct RandomSentences<R: Rng + Send> {
    rng: R,
}

impl RandomSentences<rand::rngs::StdRng> {
    pub fn new() -> Self {
        use rand::SeedableRng;
        Self {
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }
}

impl Default for RandomSentences<rand::rngs::StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng + Send> RandomSentences<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + Send> PayloadSource for RandomSentences<R> {
    fn next_payload(&mut self) -> Option<Payload> {
        let sentence = SENTENCES.choose(&mut self.rng)?;
        info!(buzz = %sentence, "Generated buzz");
        Some(Payload::new(*sentence))
    }
}
