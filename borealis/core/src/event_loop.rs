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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::error::{BorealisError, Result};

/// Consumer side of an [`EventLoop`]. Implementations process one event at a
/// time and may post follow-up events through the provided sender.
#[async_trait]
pub trait EventAction<E>: Send + Sync {
    fn on_start(&self);

    fn on_stop(&self);

    async fn on_receive(&self, event: E, tx_event: &EventSender<E>) -> Result<()>;

    fn on_error(&self, error: BorealisError);
}

/// A named, buffered event loop. Events posted through [`EventSender`] are
/// processed in order by the registered [`EventAction`] on a spawned task.
#[derive(Clone)]
pub struct EventLoop<E> {
    pub name: String,
    pub buffer_size: usize,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    tx_event: Option<mpsc::Sender<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(
        name: impl Into<String>,
        buffer_size: usize,
        action: Arc<dyn EventAction<E>>,
    ) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            tx_event: None,
        }
    }

    fn run(&self, mut rx_event: mpsc::Receiver<E>) {
        let name = self.name.clone();
        let stopped = self.stopped.clone();
        let action = self.action.clone();
        let tx_event = EventSender::new(
            self.tx_event
                .clone()
                .expect("run() called before channel creation"),
        );
        tokio::spawn(async move {
            info!("Starting the event loop {}", name);
            while !stopped.load(Ordering::SeqCst) {
                if let Some(event) = rx_event.recv().await {
                    if let Err(e) = action.on_receive(event, &tx_event).await {
                        error!("Fail to process event in the loop {}: {}", name, e);
                        action.on_error(e);
                    }
                } else {
                    info!("Event channel closed, shutting down the loop {}", name);
                    drop(rx_event);
                    return;
                }
            }
            info!("The event loop {} has been stopped", name);
            drop(rx_event);
        });
    }

    pub fn start(&mut self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BorealisError::Internal(format!(
                "{} event loop already stopped",
                self.name
            )));
        }
        if self.tx_event.is_some() {
            return Err(BorealisError::Internal(format!(
                "{} event loop already started",
                self.name
            )));
        }

        let (tx_event, rx_event) = mpsc::channel::<E>(self.buffer_size);
        self.tx_event = Some(tx_event);
        self.run(rx_event);
        self.action.on_start();

        Ok(())
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.action.on_stop();
        } else {
            debug!("{} event loop is already stopped", self.name);
        }
    }

    pub fn get_sender(&self) -> Result<EventSender<E>> {
        Ok(EventSender {
            tx_event: self.tx_event.clone().ok_or_else(|| {
                BorealisError::Internal("Event sender not exist!!!".to_string())
            })?,
        })
    }
}

#[derive(Clone)]
pub struct EventSender<E> {
    tx_event: mpsc::Sender<E>,
}

impl<E: Send + 'static> EventSender<E> {
    pub fn new(tx_event: mpsc::Sender<E>) -> Self {
        Self { tx_event }
    }

    pub async fn post_event(&self, event: E) -> Result<()> {
        self.tx_event.send(event).await.map_err(|e| {
            BorealisError::Internal(format!("Fail to send event due to {e}"))
        })
    }
}
