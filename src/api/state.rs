use std::sync::Arc;

use crate::brain::Brain;
use crate::edge::Edge;

#[derive(Clone)]
pub struct BrainState {
    pub brain: Arc<Brain>,
}

#[derive(Clone)]
pub struct EdgeState {
    pub edge: Arc<Edge>,
}
