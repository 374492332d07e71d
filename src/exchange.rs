//! Movement of particle data between ranks.

use std::ops::Range;

use mpi::traits::CommunicatorCollectives;

use crate::{
    assignment::{manifest_count, SendList},
    error::DomainError,
    layout::range_count,
    tools::{redistribute, redistribute_with_counts},
};

fn gather_ranges(array: &[f64], ranges: &[Range<usize>], offset: usize) -> Vec<f64> {
    let mut buffer = Vec::with_capacity(range_count(ranges));
    for range in ranges {
        buffer.extend_from_slice(&array[offset + range.start..offset + range.end]);
    }
    buffer
}

/// Move every particle to the rank that owns its key.
///
/// The particles currently owned occupy `input_range` of every array, sorted by key, and
/// `send_list` refers to positions within that range. Afterwards every array has length
/// `buffer_size`. The particles kept locally are placed at the start of `output_range`,
/// followed by the received particles in rank order. The particles in `output_range` are not
/// sorted by key.
///
/// Panics if the number of particles that arrive does not fill `output_range`, since that
/// means that the ranks disagree on the global tree.
pub fn exchange_particles<C: CommunicatorCollectives>(
    send_list: &SendList,
    rank: usize,
    input_range: Range<usize>,
    output_range: Range<usize>,
    buffer_size: usize,
    arrays: &mut [&mut Vec<f64>],
    comm: &C,
) {
    assert_eq!(send_list.len(), comm.size() as usize);
    assert!(output_range.end <= buffer_size);

    let counts: Vec<i32> = send_list
        .iter()
        .enumerate()
        .map(|(dest, manifest)| {
            if dest == rank {
                0
            } else {
                manifest_count(manifest) as i32
            }
        })
        .collect();

    let outgoing = send_list
        .iter()
        .enumerate()
        .filter(|&(dest, _)| dest != rank)
        .flat_map(|(_, manifest)| manifest.iter().cloned())
        .collect::<Vec<_>>();

    let retained = &send_list[rank];
    let n_retained = manifest_count(retained);

    let sent = range_count(&outgoing);
    assert_eq!(
        sent + n_retained,
        input_range.len(),
        "every owned particle is either sent or retained"
    );

    for array in arrays.iter_mut() {
        let send_buffer = gather_ranges(array, &outgoing, input_range.start);
        let received = redistribute(&send_buffer, &counts, comm);

        assert_eq!(
            n_retained + received.len(),
            output_range.len(),
            "particle exchange must fill the assigned range on rank {}",
            rank
        );

        let mut new_array = vec![0.0; buffer_size];
        let kept = gather_ranges(array, retained, input_range.start);
        new_array[output_range.start..output_range.start + n_retained].copy_from_slice(&kept);
        new_array[output_range.start + n_retained..output_range.end].copy_from_slice(&received);

        **array = new_array;
    }

    log::debug!(
        "Rank {}: sent {} particles, kept {}, received {}.",
        rank,
        sent,
        n_retained,
        output_range.len() - n_retained
    );
}

/// Refresh the halo copies.
///
/// `outgoing[r]` are the index ranges sent to rank `r`, `incoming[r]` the ranges that are
/// filled with the data received from rank `r`. The received amount is checked against
/// `incoming` before any array is modified.
pub fn halo_exchange<C: CommunicatorCollectives>(
    incoming: &[Vec<Range<usize>>],
    outgoing: &[Vec<Range<usize>>],
    arrays: &mut [&mut Vec<f64>],
    comm: &C,
) -> Result<(), DomainError> {
    let n_ranks = comm.size() as usize;
    assert_eq!(incoming.len(), n_ranks);
    assert_eq!(outgoing.len(), n_ranks);

    let send_counts: Vec<i32> = outgoing
        .iter()
        .map(|ranges| range_count(ranges) as i32)
        .collect();
    let expected: Vec<usize> = incoming.iter().map(|ranges| range_count(ranges)).collect();

    let outgoing_ranges = outgoing.iter().flatten().cloned().collect::<Vec<_>>();

    let mut received_arrays = Vec::with_capacity(arrays.len());
    let mut mismatch = None;

    // Every array is exchanged even after a mismatch so that all ranks complete the
    // same sequence of collectives.
    for array in arrays.iter() {
        let send_buffer = gather_ranges(array, &outgoing_ranges, 0);
        let (received, recv_counts) = redistribute_with_counts(&send_buffer, &send_counts, comm);

        if mismatch.is_none() {
            mismatch = recv_counts
                .iter()
                .zip(expected.iter())
                .enumerate()
                .find(|&(_, (&count, &expected))| count as usize != expected)
                .map(|(source, (&count, &expected))| DomainError::MessageSizeMismatch {
                    rank: source,
                    expected,
                    received: count as usize,
                });
        }

        received_arrays.push(received);
    }

    if let Some(error) = mismatch {
        return Err(error);
    }

    for (array, received) in arrays.iter_mut().zip(received_arrays) {
        let mut position = 0;
        for range in incoming.iter().flatten() {
            array[range.clone()].copy_from_slice(&received[position..position + range.len()]);
            position += range.len();
        }
    }

    Ok(())
}
