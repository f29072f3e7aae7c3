//! Election timers. Each timer is a task that pokes the replica actor when a deadline passes, and
//! a handle the actor uses to push that deadline out. Dropping the handle ends the task.
mod clock;
mod deadline;
mod follower_timer;
mod leader_timer;

#[cfg(test)]
mod test_support;

pub(super) use follower_timer::FollowerTimerHandle;
pub(super) use leader_timer::LeaderTimerHandle;
