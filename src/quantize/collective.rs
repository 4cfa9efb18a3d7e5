//! Distributed collectives for data-parallel training.

pub use super::*;

use std::{
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
    thread,
};
use tokio::sync::{mpsc, oneshot};

/// Sum-reduction among the data-parallel replicas.
pub trait Collective<B: Backend> {
    type Pending: PendingReduce<B>;

    /// Whether the distributed training is active.
    fn is_initialized(&self) -> bool;

    /// Start summing the tensor over all replicas without blocking.
    fn all_reduce_sum(
        &self,
        tensor: Tensor<B, 1>,
    ) -> Self::Pending;
}

/// A reduction in flight.
pub trait PendingReduce<B: Backend> {
    /// Block until the reduction completes.
    fn wait(self) -> Result<Tensor<B, 1>, Error>;
}

/// A reduction that has already completed.
#[derive(Clone, Debug)]
pub struct Ready<B: Backend>(pub Tensor<B, 1>);

impl<B: Backend> PendingReduce<B> for Ready<B> {
    #[inline]
    fn wait(self) -> Result<Tensor<B, 1>, Error> {
        Ok(self.0)
    }
}

/// Single process. It is never initialized.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCollective;

impl<B: Backend> Collective<B> for LocalCollective {
    type Pending = Ready<B>;

    #[inline]
    fn is_initialized(&self) -> bool {
        false
    }

    #[inline]
    fn all_reduce_sum(
        &self,
        tensor: Tensor<B, 1>,
    ) -> Self::Pending {
        Ready(tensor)
    }
}

/// A member of an in-process group whose replicas run on separate threads.
///
/// ## Details
///
/// The `n`-th reduction of every member belongs to the same round.
/// Each member must issue the same sequence of reductions.
///
/// A reducer thread owns the rounds. It sums the contributions of each round
/// and replies to every member once all of them have contributed.
/// It shuts down when all members are dropped.
pub struct ThreadGroup<B: Backend> {
    rank: usize,
    world_size: usize,
    round_next: AtomicU64,
    sender: mpsc::UnboundedSender<Contribution>,
    __: PhantomData<B>,
}

/// A reduction of [`ThreadGroup`] in flight.
pub struct ThreadGroupPending<B: Backend> {
    device: B::Device,
    round: u64,
    reply: oneshot::Receiver<Result<Vec<f32>, Error>>,
}

/// A contribution submitted to the reducer.
struct Contribution {
    round: u64,
    values: Result<Vec<f32>, String>,
    reply: oneshot::Sender<Result<Vec<f32>, Error>>,
}

#[derive(Default)]
struct Round {
    sum: Vec<f32>,
    replies: Vec<oneshot::Sender<Result<Vec<f32>, Error>>>,
    error: Option<String>,
}

impl<B: Backend> ThreadGroup<B> {
    /// Create all members of a group of `world_size`.
    ///
    /// The member at index `r` has rank `r`.
    pub fn new(world_size: usize) -> Vec<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        thread::spawn(move || run_reducer(world_size, receiver));

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                round_next: AtomicU64::new(0),
                sender: sender.to_owned(),
                __: PhantomData,
            })
            .collect()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

impl<B: Backend> Collective<B> for ThreadGroup<B> {
    type Pending = ThreadGroupPending<B>;

    #[inline]
    fn is_initialized(&self) -> bool {
        true
    }

    fn all_reduce_sum(
        &self,
        tensor: Tensor<B, 1>,
    ) -> Self::Pending {
        let device = tensor.device();
        let round = self.round_next.fetch_add(1, Ordering::Relaxed);
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|error| format!("{error:?}"));
        let (reply_sender, reply) = oneshot::channel();

        // The reply sender is dropped with the contribution if the reducer is gone.
        if self
            .sender
            .send(Contribution {
                round,
                values,
                reply: reply_sender,
            })
            .is_err()
        {
            log::error!(
                target: "triplane_vq::quantize::collective",
                "The reducer of rank {} has shut down",
                self.rank,
            );
        }

        ThreadGroupPending {
            device,
            round,
            reply,
        }
    }
}

impl<B: Backend> PendingReduce<B> for ThreadGroupPending<B> {
    /// Block until the reduction completes.
    ///
    /// It should not be called inside an async runtime.
    fn wait(self) -> Result<Tensor<B, 1>, Error> {
        let sum = self.reply.blocking_recv().map_err(|_| {
            Error::Collective(format!("The reply of round {} is dropped", self.round))
        })??;
        let length = sum.len();

        Ok(Tensor::from_data(
            TensorData::new(sum, [length]).convert::<B::FloatElem>(),
            &self.device,
        ))
    }
}

impl Round {
    fn add(
        &mut self,
        values: Result<Vec<f32>, String>,
    ) {
        let values = match values {
            Ok(values) => values,
            Err(error) => {
                self.error.get_or_insert(error);
                return;
            },
        };
        if self.sum.is_empty() && self.replies.is_empty() {
            self.sum = vec![0.0; values.len()];
        }
        if self.sum.len() != values.len() {
            self.error.get_or_insert_with(|| {
                format!(
                    "The length of contribution ({}) should be {}",
                    values.len(),
                    self.sum.len()
                )
            });
            return;
        }
        self.sum
            .iter_mut()
            .zip(values)
            .for_each(|(sum, value)| *sum += value);
    }

    fn finish(self) {
        for reply in self.replies {
            let result = match &self.error {
                Some(error) => Err(Error::Collective(error.to_owned())),
                None => Ok(self.sum.to_owned()),
            };
            // The member may have dropped its pending reduction.
            let _ = reply.send(result);
        }
    }
}

/// The reducer loop, running in a dedicated thread.
fn run_reducer(
    world_size: usize,
    mut receiver: mpsc::UnboundedReceiver<Contribution>,
) {
    let mut rounds = HashMap::<u64, Round>::new();

    while let Some(contribution) = receiver.blocking_recv() {
        let key = contribution.round;
        let is_complete = {
            let round = rounds.entry(key).or_default();
            round.add(contribution.values);
            round.replies.push(contribution.reply);
            round.replies.len() == world_size
        };
        if is_complete {
            if let Some(round) = rounds.remove(&key) {
                round.finish();
            }
        }
    }

    #[cfg(debug_assertions)]
    log::debug!(
        target: "triplane_vq::quantize::collective",
        "The reducer of {world_size} members has shut down ({} rounds incomplete)",
        rounds.len(),
    );
}

impl<B: Backend> fmt::Debug for ThreadGroup<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct(&format!("ThreadGroup<{}>", B::name()))
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("round_next", &self.round_next.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B: Backend> fmt::Debug for ThreadGroupPending<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct(&format!("ThreadGroupPending<{}>", B::name()))
            .field("device", &self.device)
            .field("round", &self.round)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn local() {
        let device = &Default::default();

        let collective = LocalCollective;
        assert!(!Collective::<B>::is_initialized(&collective));

        let tensor = Tensor::<B, 1>::from_data([1.0, 2.0], device);
        let output = collective.all_reduce_sum(tensor.to_owned()).wait().unwrap();
        output.into_data().assert_eq(&tensor.into_data(), true);
    }

    #[test]
    fn thread_group_sums() {
        let members = ThreadGroup::<B>::new(3);
        assert_eq!(members[2].rank(), 2);
        assert_eq!(members[2].world_size(), 3);

        let outputs = std::thread::scope(|scope| {
            members
                .iter()
                .map(|member| {
                    scope.spawn(move || {
                        let device = &Default::default();
                        let rank = member.rank() as f32;
                        (0..2)
                            .map(|round| {
                                let tensor = Tensor::<B, 1>::from_data(
                                    [rank, 1.0, round as f32],
                                    device,
                                );
                                member
                                    .all_reduce_sum(tensor)
                                    .wait()
                                    .unwrap()
                                    .into_data()
                                    .to_vec::<f32>()
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        outputs.into_iter().for_each(|rounds| {
            assert_eq!(rounds, [vec![3.0, 3.0, 0.0], vec![3.0, 3.0, 3.0]]);
        });
    }

    #[test]
    fn thread_group_issues_before_waiting() {
        let members = ThreadGroup::<B>::new(2);

        let outputs = std::thread::scope(|scope| {
            members
                .iter()
                .map(|member| {
                    scope.spawn(move || {
                        let device = &Default::default();
                        let first = member.all_reduce_sum(Tensor::<B, 1>::ones([2], device));
                        let second = member
                            .all_reduce_sum(Tensor::<B, 1>::from_data([2.0, 4.0], device));
                        let second = second.wait().unwrap().into_data().to_vec::<f32>();
                        let first = first.wait().unwrap().into_data().to_vec::<f32>();
                        (first.unwrap(), second.unwrap())
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        outputs.into_iter().for_each(|(first, second)| {
            assert_eq!(first, [2.0, 2.0]);
            assert_eq!(second, [4.0, 8.0]);
        });
    }

    #[test]
    fn thread_group_incomplete_round() {
        let device = &Default::default();

        let members = ThreadGroup::<B>::new(2);
        let pending = members[0].all_reduce_sum(Tensor::<B, 1>::ones([1], device));
        drop(members);

        assert!(matches!(pending.wait(), Err(Error::Collective(_))));
    }

    #[test]
    fn thread_group_mismatch() {
        let members = ThreadGroup::<B>::new(2);

        let errors = std::thread::scope(|scope| {
            members
                .iter()
                .map(|member| {
                    scope.spawn(move || {
                        let device = &Default::default();
                        let length = member.rank() + 1;
                        let tensor = Tensor::<B, 1>::ones([length], device);
                        member.all_reduce_sum(tensor).wait().is_err()
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(errors, [true, true]);
    }
}
