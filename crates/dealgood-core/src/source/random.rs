use super::{NextRequest, RequestSource};
use crate::request::Request;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::Method;

/// Built-in gateway requests used when no recorded traffic is available.
pub fn sample_requests() -> Vec<Request> {
    let car = HeaderValue::from_static("application/vnd.ipld.car");
    let raw = HeaderValue::from_static("application/vnd.ipld.raw");

    vec![
        Request::get("/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi"),
        Request::get("/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi/")
            .with_header(ACCEPT, car),
        Request::get("/ipfs/QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn"),
        Request::get("/ipfs/bafkqaaa"),
        Request::get("/ipfs/bafkqaaa?format=raw"),
        Request::get("/ipfs/QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn").with_header(ACCEPT, raw),
        Request::new(Method::HEAD, "/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi"),
        Request::get("/ipns/docs.ipfs.tech/"),
        Request::get("/ipns/docs.ipfs.tech/concepts/what-is-ipfs/"),
        Request::get("/ipns/en.wikipedia-on-ipfs.org/wiki/"),
        Request::get("/ipns/en.wikipedia-on-ipfs.org/wiki/InterPlanetary_File_System"),
        Request::new(Method::HEAD, "/ipns/en.wikipedia-on-ipfs.org/wiki/"),
        Request::get("/ipfs/bafybeihvjtsmwfuazd5r3odqfemy5fjn4ws6jkz3bmvdsfjmlgrjzsvvfu"),
        Request::get("/ipfs/QmNonExistentPathThatShouldNotResolve/missing.txt"),
    ]
}

/// Infinite sampler over a fixed corpus, reproducible from its seed.
pub struct RandomSource {
    corpus: Vec<Request>,
    seed: u64,
    rng: StdRng,
    jitter: bool,
}

impl RandomSource {
    pub fn new(corpus: Vec<Request>, seed: u64) -> Self {
        Self {
            corpus,
            seed,
            rng: StdRng::seed_from_u64(seed),
            jitter: false,
        }
    }

    /// Append a random query parameter so gateway caches see distinct URLs.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Restart the sequence from the seed.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    fn sample(&mut self) -> Option<Request> {
        if self.corpus.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.corpus.len());
        let mut req = self.corpus[idx].clone();

        if self.jitter {
            let sep = if req.uri.contains('?') { '&' } else { '?' };
            let nonce: u32 = self.rng.gen();
            req.uri = format!("{}{}dealgood={:08x}", req.uri, sep, nonce);
        }
        Some(req)
    }
}

impl RequestSource for RandomSource {
    fn name(&self) -> &'static str {
        "random"
    }

    fn next_request(&mut self) -> NextRequest<'_> {
        let req = self.sample();
        Box::pin(async move { Ok(req) })
    }
}
