pub mod region;
pub mod mask_shape;
pub mod labeling;
pub mod node;
pub mod frame_graph;
pub mod matcher;
pub mod watershed;
pub mod corrector;
pub mod trajectory;
