//! Utility routines.

use itertools::{izip, Itertools};
use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    traits::{CommunicatorCollectives, Equivalence, Root},
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::morton::{encode_morton, grid_size, SfcKey};

/// Gather array to all processes
pub fn gather_to_all<T: Equivalence, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> Vec<T> {
    // First we need to broadcast the individual sizes on each process.

    let size = comm.size();

    let local_len = arr.len() as i32;

    let mut sizes = vec![0; size as usize];

    comm.all_gather_into(&local_len, &mut sizes);

    let recv_len = sizes.iter().sum::<i32>() as usize;

    let mut recvbuffer = Vec::<T>::with_capacity(recv_len);
    let buf: &mut [T] = unsafe { std::mem::transmute(recvbuffer.spare_capacity_mut()) };

    let recv_displs = displacements(&sizes);

    let mut receiv_partition = PartitionMut::new(buf, sizes, &recv_displs[..]);

    comm.all_gather_varcount_into(arr, &mut receiv_partition);

    unsafe { recvbuffer.set_len(recv_len) };

    recvbuffer
}

/// Gather distributed array to the root rank.
///
/// The result is a `Vec<T>` on root and `None` on all other ranks.
pub fn gather_to_root<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<Vec<T>> {
    let n = arr.len() as i32;
    let rank = comm.rank();
    let size = comm.size();
    let root_process = comm.process_at_rank(0);

    if rank == 0 {
        let mut counts = vec![0_i32; size as usize];
        root_process.gather_into_root(&n, &mut counts);

        let nelements = counts.iter().sum::<i32>();
        let mut new_arr = Vec::<T>::with_capacity(nelements as usize);
        let new_arr_buf: &mut [T] = unsafe { std::mem::transmute(new_arr.spare_capacity_mut()) };

        let displs = displacements(counts.as_slice());

        let mut partition = PartitionMut::new(new_arr_buf, counts, &displs[..]);

        root_process.gather_varcount_into_root(arr, &mut partition);

        unsafe { new_arr.set_len(nelements as usize) };
        Some(new_arr)
    } else {
        root_process.gather_into(&n);
        root_process.gather_varcount_into(arr);
        None
    }
}

/// Get global size of a distributed array.
///
/// Computes the size and broadcasts it to all ranks.
pub fn global_size<T, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> usize {
    let local_size = arr.len();
    let mut global_size = 0;

    comm.all_reduce_into(&local_size, &mut global_size, SystemOperation::sum());

    global_size
}

/// Return true on all ranks if `flag` is true on all ranks.
pub fn global_all<C: CommunicatorCollectives>(flag: bool, comm: &C) -> bool {
    let mut result = false;
    comm.all_reduce_into(&flag, &mut result, SystemOperation::logical_and());
    result
}

/// Redistribute an array via an all_to_all_varcount operation.
///
/// Rank `r` receives the `counts[r]` consecutive elements of `arr` that follow the elements
/// destined for ranks `0..r`. Also returns how many elements arrived from each rank.
pub fn redistribute_with_counts<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> (Vec<T>, Vec<i32>) {
    assert_eq!(counts.len(), comm.size() as usize);
    assert_eq!(counts.iter().sum::<i32>() as usize, arr.len());

    // First send the counts around via an alltoall operation.

    let mut recv_counts = vec![0; counts.len()];

    comm.all_to_all_into(counts, &mut recv_counts);

    // We have the recv_counts. Allocate space and setup the partitions.

    let nelems = recv_counts.iter().sum::<i32>() as usize;

    let mut output = Vec::<T>::with_capacity(nelems);
    let out_buf: &mut [T] = unsafe { std::mem::transmute(output.spare_capacity_mut()) };

    let send_partition = Partition::new(arr, counts, displacements(counts));
    let mut recv_partition =
        PartitionMut::new(out_buf, &recv_counts[..], displacements(&recv_counts));

    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    unsafe { output.set_len(nelems) };

    (output, recv_counts)
}

/// Redistribute an array via an all_to_all_varcount operation.
pub fn redistribute<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> Vec<T> {
    redistribute_with_counts(arr, counts, comm).0
}

/// Distribute a sorted sequence into bins.
///
/// For an array with n elements to be distributed into p bins,
/// the array `bins` has p elements. The bins are defined by half-open intervals
/// of the form [b_j, b_{j+1}). The final bin is the half-open interval [b_{p-1}, \infty).
/// It is assumed that the bins and the elements are both sorted sequences and that
/// every element has an associated bin.
/// The function returns a p element array with the counts of how many elements go to each bin.
/// Since the sequence is sorted this fully defines what element goes into which bin.
pub fn sort_to_bins<T: Ord>(sorted_keys: &[T], bins: &[T]) -> Vec<usize> {
    let nbins = bins.len();

    if sorted_keys.is_empty() {
        return vec![0; nbins];
    }

    // Make sure that the smallest element of the sorted keys fits into the bins.
    assert!(bins.first().unwrap() <= sorted_keys.first().unwrap());

    // Each bin boundary splits the sorted keys at the first element not smaller than it.
    let mut boundaries = bins
        .iter()
        .map(|bin| sorted_keys.partition_point(|key| key < bin))
        .collect_vec();
    boundaries.push(sorted_keys.len());

    boundaries
        .iter()
        .tuple_windows()
        .map(|(first, last)| last - first)
        .collect()
}

/// Compute displacements from a vector of counts.
///
/// This is useful for global MPI varcount operations. Let
/// count [ 3, 4, 5]. Then the corresponding displacements are
/// [0, 3, 7]. Note that the last element `5` is ignored.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Return the permutation that sorts `arr` in ascending order.
///
/// The sort is stable, so equal keys keep their relative order.
pub fn argsort<T: Ord + Copy + Send + Sync>(arr: &[T]) -> Vec<usize> {
    let mut sort_indices = (0..arr.len()).collect_vec();
    sort_indices.par_sort_by_key(|&index| arr[index]);
    sort_indices
}

/// Gather `arr` in the order given by `permutation`.
pub fn reorder<T: Copy>(arr: &[T], permutation: &[usize]) -> Vec<T> {
    let mut reordered = Vec::<T>::with_capacity(permutation.len());
    for &index in permutation.iter() {
        reordered.push(arr[index])
    }
    reordered
}

/// Apply `permutation` to the sub-slice of `arr` that starts at `offset`.
pub fn reorder_from<T: Copy>(arr: &mut [T], permutation: &[usize], offset: usize) {
    let reordered = reorder(&arr[offset..offset + permutation.len()], permutation);
    arr[offset..offset + permutation.len()].copy_from_slice(&reordered);
}

/// Generate random keys on the deepest level for testing.
pub fn generate_random_keys<K: SfcKey, R: Rng>(nkeys: usize, rng: &mut R) -> Vec<K> {
    let n = grid_size::<K>();

    (0..nkeys)
        .map(|_| encode_morton([rng.gen_range(0..n), rng.gen_range(0..n), rng.gen_range(0..n)]))
        .collect()
}

/// Particle coordinates and smoothing lengths stored as separate arrays.
pub struct ParticleArrays {
    /// x-coordinates.
    pub x: Vec<f64>,
    /// y-coordinates.
    pub y: Vec<f64>,
    /// z-coordinates.
    pub z: Vec<f64>,
    /// Smoothing lengths.
    pub h: Vec<f64>,
}

/// Generate uniformly distributed particles in `[min, max)^3` with a constant smoothing length.
pub fn generate_random_particles<R: Rng>(
    nparticles: usize,
    min: f64,
    max: f64,
    h: f64,
    rng: &mut R,
) -> ParticleArrays {
    let mut sample = || (0..nparticles).map(|_| rng.gen_range(min..max)).collect_vec();

    let x = sample();
    let y = sample();
    let z = sample();

    ParticleArrays {
        x,
        y,
        z,
        h: vec![h; nparticles],
    }
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Check that an array holds the same values on all ranks.
pub fn is_identical_on_all_ranks<T: Equivalence + PartialEq, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> bool {
    let size = comm.size() as usize;

    let mut identical = false;

    if let Some(all) = gather_to_root(arr, comm) {
        identical = all.len() == size * arr.len()
            && all
                .chunks(arr.len().max(1))
                .all(|chunk| izip!(chunk, arr).all(|(a, b)| a == b));
    }

    comm.process_at_rank(0).broadcast_into(&mut identical);

    identical
}
