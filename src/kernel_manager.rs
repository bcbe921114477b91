//! Registry of the kernels a test evaluates on each block.

use crate::kernel::{Kernel, KernelType};
use crate::{Error, Result};

/// Ordered set of kernels.
///
/// A test keeps its kernel at index 0; kernel selection uses a separate
/// manager holding all candidates.
#[derive(Debug, Clone, Default)]
pub struct KernelManager {
    kernels: Vec<Box<dyn Kernel>>,
}

impl KernelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, kernel: Box<dyn Kernel>) {
        self.kernels.push(kernel);
    }

    /// Replace the kernel at `index`, growing the registry if needed.
    pub fn set_kernel_at(&mut self, index: usize, kernel: Box<dyn Kernel>) -> Result<()> {
        match index.cmp(&self.kernels.len()) {
            std::cmp::Ordering::Less => self.kernels[index] = kernel,
            std::cmp::Ordering::Equal => self.kernels.push(kernel),
            std::cmp::Ordering::Greater => {
                return Err(Error::IndexOutOfBounds {
                    index,
                    len: self.kernels.len(),
                })
            }
        }
        Ok(())
    }

    pub fn kernel_at(&self, index: usize) -> Option<&dyn Kernel> {
        self.kernels.get(index).map(|k| k.as_ref())
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn clear(&mut self) {
        self.kernels.clear();
    }

    /// The kernels a streaming pass evaluates: the sub-kernels of a combined
    /// kernel at `index`, or that kernel alone.
    pub fn active_kernels(&self, index: usize) -> Result<Vec<&dyn Kernel>> {
        let kernel = self.kernel_at(index).ok_or(Error::KernelNotSet)?;
        if kernel.kernel_type() == KernelType::Combined {
            let subkernels: Vec<&dyn Kernel> =
                kernel.subkernels().iter().map(|k| k.as_ref()).collect();
            if subkernels.is_empty() {
                return Err(Error::InvalidConfig(
                    "combined kernel has no sub-kernels".to_string(),
                ));
            }
            Ok(subkernels)
        } else {
            Ok(vec![kernel])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CombinedKernel, GaussianKernel, LinearKernel};

    #[test]
    fn test_active_kernels_single() {
        let mut km = KernelManager::new();
        km.push_back(Box::new(LinearKernel));
        let active = km.active_kernels(0).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kernel_type(), KernelType::Linear);
    }

    #[test]
    fn test_active_kernels_expands_combined() {
        let mut combined = CombinedKernel::new();
        combined.append_kernel(Box::new(GaussianKernel::new(0.5).unwrap()));
        combined.append_kernel(Box::new(LinearKernel));

        let mut km = KernelManager::new();
        km.push_back(Box::new(combined));
        let active = km.active_kernels(0).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].kernel_type(), KernelType::Gaussian);
        assert_eq!(active[1].kernel_type(), KernelType::Linear);
    }

    #[test]
    fn test_missing_and_empty_kernels() {
        let mut km = KernelManager::new();
        assert!(matches!(km.active_kernels(0), Err(Error::KernelNotSet)));

        km.push_back(Box::new(CombinedKernel::new()));
        assert!(matches!(km.active_kernels(0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_set_kernel_at() {
        let mut km = KernelManager::new();
        km.set_kernel_at(0, Box::new(LinearKernel)).unwrap();
        km.set_kernel_at(0, Box::new(GaussianKernel::new(1.0).unwrap())).unwrap();
        assert_eq!(km.num_kernels(), 1);
        assert_eq!(km.kernel_at(0).unwrap().kernel_type(), KernelType::Gaussian);
        assert!(km.set_kernel_at(3, Box::new(LinearKernel)).is_err());
    }
}
