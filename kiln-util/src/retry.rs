// Copyright 2025 The Kiln Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::Future;
use futures::stream::StreamExt;
use kiln_config::Retry;
use kiln_error::{Code, Error, make_err};
use tracing::debug;

struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    const fn new(base: Duration) -> Self {
        ExponentialBackoff { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.current *= 2;
        Some(self.current)
    }
}

type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Sync + Send>;
type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

#[derive(PartialEq, Eq, Debug)]
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Retries a job with a sleep function in between each retry.
#[derive(Clone)]
pub struct Retrier {
    sleep_fn: SleepFn,
    jitter_fn: JitterFn,
    config: Retry,
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn, jitter_fn: JitterFn, config: Retry) -> Self {
        Retrier {
            sleep_fn,
            jitter_fn,
            config,
        }
    }

    /// A retrier backed by the tokio timer and a multiplicative jitter.
    pub fn default_with(config: Retry) -> Self {
        let jitter_amt = config.jitter;
        Self::new(
            Arc::new(|duration| Box::pin(tokio::time::sleep(duration))),
            Arc::new(move |delay| {
                if jitter_amt == 0. {
                    return delay;
                }
                delay.mul_f32(jitter_amt * (rand::random::<f32>() - 0.5) + 1.)
            }),
            config,
        )
    }

    /// Only returns true if the error code should be interpreted as temporary.
    fn should_retry(code: Code) -> bool {
        matches!(
            code,
            Code::Unknown
                | Code::Cancelled
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
                | Code::Unavailable
                | Code::DataLoss
        )
    }

    fn get_retry_config(&self) -> impl Iterator<Item = Duration> + '_ {
        ExponentialBackoff::new(Duration::from_millis(self.config.delay_ms))
            .map(|d| (self.jitter_fn)(d))
            // This is number of retries, so will run max_retries + 1 attempts.
            .take(self.config.max_retries)
    }

    pub fn retry<'a, T, S>(
        &'a self,
        operation: S,
    ) -> Pin<Box<dyn Future<Output = Result<T, Error>> + 'a + Send>>
    where
        S: futures::stream::Stream<Item = RetryResult<T>> + Send + 'a,
        T: Send,
    {
        Box::pin(async move {
            let mut iter = self.get_retry_config();
            let mut operation = Box::pin(operation);
            let mut attempt = 0;
            loop {
                attempt += 1;
                match operation.next().await {
                    None => {
                        return Err(make_err!(
                            Code::Internal,
                            "Retry stream ended abruptly on attempt {attempt}",
                        ));
                    }
                    Some(RetryResult::Ok(value)) => return Ok(value),
                    Some(RetryResult::Err(e)) => {
                        return Err(e.append(format!("On attempt {attempt}")));
                    }
                    Some(RetryResult::Retry(e)) => {
                        if !Self::should_retry(e.code) {
                            debug!("Not retrying permanent error on attempt {attempt}: {e:?}");
                            return Err(e);
                        }
                        (self.sleep_fn)(
                            iter.next()
                                .ok_or_else(|| e.append(format!("On attempt {attempt}")))?,
                        )
                        .await;
                    }
                }
            }
        })
    }
}
