//! Output pacer: slices agent audio into 20ms frames and emits them to
//! the PBX socket at wall-clock rate, with barge-in handling.
//!
//! Per the re-architecture notes, barge-in is a per-chunk check, not a
//! coarser one: hoisting it to (say) a per-response boundary would let a
//! whole in-flight response play out after the user starts talking. Each
//! `PacerCommand` is therefore handled frame-by-frame.

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::frame::{Frame, AUDIO_24K_FRAME_BYTES};

pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// ~100ms of silence pumped on barge-in so the PBX leg doesn't hear a
/// hard audio cut.
const SILENCE_FRAMES_ON_BARGE_IN: usize = 5;

pub enum PacerCommand {
    Emit(Vec<u8>),
    Drain,
    Park,
}

pub struct OutputPacer {
    rx: mpsc::Receiver<PacerCommand>,
    frame_tx: mpsc::Sender<Frame>,
    pending: std::collections::VecDeque<u8>,
    parked: bool,
}

impl OutputPacer {
    pub fn new(rx: mpsc::Receiver<PacerCommand>, frame_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            rx,
            frame_tx,
            pending: std::collections::VecDeque::new(),
            parked: false,
        }
    }

    /// Runs the pacer until the command channel closes or the frame
    /// channel's receiver is dropped. Never blocks draining the egress
    /// socket during barge-in — `Drain` just clears buffered bytes and
    /// pumps a short burst of silence instead of waiting on anything.
    pub async fn run(mut self) {
        let mut ticker = interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(PacerCommand::Emit(pcm)) => {
                            // A genuinely new response's first delta resumes
                            // emission; Park only suppresses output for the
                            // response that was barged in on.
                            self.parked = false;
                            self.pending.extend(pcm);
                        }
                        Some(PacerCommand::Drain) => {
                            self.pending.clear();
                            if self.emit_silence_burst().await.is_err() {
                                return;
                            }
                        }
                        Some(PacerCommand::Park) => {
                            self.pending.clear();
                            self.parked = true;
                        }
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    if self.parked {
                        continue;
                    }
                    if self.emit_next_frame().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn emit_next_frame(&mut self) -> Result<(), ()> {
        if self.pending.len() < AUDIO_24K_FRAME_BYTES {
            return Ok(());
        }
        let frame: Vec<u8> = self.pending.drain(..AUDIO_24K_FRAME_BYTES).collect();
        self.frame_tx
            .send(Frame::Audio24k(frame))
            .await
            .map_err(|_| ())
    }

    async fn emit_silence_burst(&mut self) -> Result<(), ()> {
        for _ in 0..SILENCE_FRAMES_ON_BARGE_IN {
            self.frame_tx
                .send(Frame::Audio24k(vec![0u8; AUDIO_24K_FRAME_BYTES]))
                .await
                .map_err(|_| ())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_clears_pending_and_emits_silence() {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let pacer = OutputPacer::new(cmd_rx, frame_tx);
        let handle = tokio::spawn(pacer.run());

        cmd_tx
            .send(PacerCommand::Emit(vec![1u8; AUDIO_24K_FRAME_BYTES * 2]))
            .await
            .unwrap();
        cmd_tx.send(PacerCommand::Drain).await.unwrap();
        drop(cmd_tx);

        let mut silence_frames = 0;
        while let Some(frame) = frame_rx.recv().await {
            if let Frame::Audio24k(pcm) = frame {
                if pcm.iter().all(|b| *b == 0) {
                    silence_frames += 1;
                }
            }
        }
        assert_eq!(silence_frames, SILENCE_FRAMES_ON_BARGE_IN);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn park_suppresses_ticked_emission() {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let pacer = OutputPacer::new(cmd_rx, frame_tx);
        let handle = tokio::spawn(pacer.run());

        cmd_tx.send(PacerCommand::Park).await.unwrap();
        tokio::time::sleep(FRAME_DURATION * 2).await;
        drop(cmd_tx);

        assert!(frame_rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn emit_after_park_resumes_emission() {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let pacer = OutputPacer::new(cmd_rx, frame_tx);
        let handle = tokio::spawn(pacer.run());

        cmd_tx.send(PacerCommand::Park).await.unwrap();
        cmd_tx
            .send(PacerCommand::Emit(vec![1u8; AUDIO_24K_FRAME_BYTES]))
            .await
            .unwrap();
        tokio::time::sleep(FRAME_DURATION * 2).await;
        drop(cmd_tx);

        let mut saw_frame = false;
        while let Some(frame) = frame_rx.recv().await {
            if let Frame::Audio24k(pcm) = frame {
                if pcm.iter().all(|b| *b == 1) {
                    saw_frame = true;
                }
            }
        }
        assert!(saw_frame);
        handle.await.unwrap();
    }
}
