use std::collections::VecDeque;

#[derive(Debug)]
pub(in crate::monitor) struct RollingBuffer {
    capacity: usize,
    values: VecDeque<f64>,
}

impl RollingBuffer {
    pub(in crate::monitor) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub(in crate::monitor) fn extend(&mut self, values: &[f64]) -> usize {
        let mut evicted = 0;
        for &value in values {
            if self.values.len() == self.capacity {
                self.values.pop_front();
                evicted += 1;
            }
            self.values.push_back(value);
        }
        evicted
    }

    pub(in crate::monitor) fn len(&self) -> usize {
        self.values.len()
    }

    pub(in crate::monitor) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(in crate::monitor) fn contents(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity() {
        let mut buffer = RollingBuffer::new(8);
        for round in 0..50 {
            let chunk: Vec<f64> = (0..(round % 7 + 1)).map(|v| v as f64).collect();
            buffer.extend(&chunk);
            assert!(buffer.len() <= buffer.capacity());
        }
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut buffer = RollingBuffer::new(4);
        assert_eq!(buffer.extend(&[1.0, 2.0, 3.0]), 0);
        assert_eq!(buffer.extend(&[4.0, 5.0, 6.0]), 2);
        assert_eq!(buffer.contents(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn oversized_batch_keeps_tail() {
        let mut buffer = RollingBuffer::new(3);
        buffer.extend(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(buffer.contents(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buffer = RollingBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
    }
}
