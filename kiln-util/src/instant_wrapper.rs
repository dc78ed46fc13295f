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

use std::time::{SystemTime, UNIX_EPOCH};

use mock_instant::thread_local::MockClock;

/// Source of wall-clock time. Injected into the file cache so TTL tests
/// can drive the clock themselves instead of sleeping.
pub trait InstantWrapper: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

impl InstantWrapper for SystemTime {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub fn default_instant_wrapper() -> impl InstantWrapper {
    SystemTime::now()
}

/// Clock backed by [`MockClock`], advanced explicitly from tests.
#[derive(Default)]
pub struct MockInstantWrapped;

impl InstantWrapper for MockInstantWrapped {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + MockClock::time()
    }
}
