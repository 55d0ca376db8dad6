// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! The pool of resource offers currently held from the cluster manager.

use dashmap::DashMap;
use log::debug;

use borealis_core::model::HostOffer;

/// Concurrent offer pool. Offers are added as the cluster manager sends
/// them, taken when a placement reserves one, and removed when rescinded.
#[derive(Default)]
pub struct OfferManager {
    offers: DashMap<String, HostOffer>,
}

impl OfferManager {
    pub fn add_offer(&self, offer: HostOffer) {
        debug!(
            "Adding offer {} from host {} ({} cpus, {} MB ram)",
            offer.offer_id, offer.host, offer.resources.num_cpus, offer.resources.ram_mb
        );
        self.offers.insert(offer.offer_id.clone(), offer);
    }

    pub fn add_offers(&self, offers: Vec<HostOffer>) {
        for offer in offers {
            self.add_offer(offer);
        }
    }

    /// The cluster manager withdrew an offer.
    pub fn rescind(&self, offer_id: &str) -> Option<HostOffer> {
        self.offers.remove(offer_id).map(|(_, offer)| offer)
    }

    /// Reserve an offer for a placement attempt. The offer leaves the pool;
    /// a failed attempt must return it.
    pub fn take(&self, offer_id: &str) -> Option<HostOffer> {
        self.offers.remove(offer_id).map(|(_, offer)| offer)
    }

    pub fn return_offer(&self, offer: HostOffer) {
        self.offers.insert(offer.offer_id.clone(), offer);
    }

    pub fn snapshot(&self) -> Vec<HostOffer> {
        let mut offers: Vec<HostOffer> =
            self.offers.iter().map(|entry| entry.value().clone()).collect();
        offers.sort_by(|a, b| a.offer_id.cmp(&b.offer_id));
        offers
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }
}
