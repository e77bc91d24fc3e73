pub mod dense_matrix;
pub mod inversion;

pub use dense_matrix::{DenseMatrix, QrFactorization};
pub use inversion::Inversion;
