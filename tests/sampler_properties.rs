use damped_wave_pinn::dataset::{RowTransform, Sample, Sampler, SamplerConfig};

fn epoch<T: RowTransform>(sampler: &mut Sampler<T>) -> Vec<Sample> {
    (0..sampler.len()).map(|_| sampler.next_batch()).collect()
}

#[test]
fn every_epoch_covers_exactly_n_points() {
    let mut sampler = SamplerConfig::new(vec![0.0, 0.0], vec![1.0, 1.0], 103)
        .with_batch_size(Some(20))
        .with_period(2)
        .init_domain()
        .unwrap();

    for _ in 0..5 {
        let rows: usize = epoch(&mut sampler).iter().map(Sample::rows).sum();
        assert_eq!(rows, 103);
    }
}

#[test]
fn domain_batches_are_sorted_in_time_and_inside_the_box() {
    let xmin = vec![-1.0, 2.0, 0.0];
    let xmax = vec![1.0, 3.0, 5.0];
    let mut sampler = SamplerConfig::new(xmin.clone(), xmax.clone(), 50)
        .with_batch_size(Some(16))
        .init_domain()
        .unwrap();

    for batch in epoch(&mut sampler) {
        let time = batch.column(2);
        assert!(time.windows(2).all(|w| w[0] <= w[1]));
        for row in 0..batch.rows() {
            for (axis, value) in batch.row(row).iter().enumerate() {
                assert!(*value >= xmin[axis] && *value <= xmax[axis]);
            }
        }
    }
}

#[test]
fn initial_batches_end_with_a_zero_time_column() {
    let mut sampler = SamplerConfig::new(vec![0.0], vec![1.0], 40)
        .with_batch_size(Some(15))
        .init_initial()
        .unwrap();

    for batch in epoch(&mut sampler) {
        assert_eq!(batch.dims(), 2);
        assert!(batch.column(1).iter().all(|t| *t == 0.0));
    }
}

#[test]
fn reset_replays_the_same_sequence() {
    let mut sampler = SamplerConfig::new(vec![0.0, 0.0], vec![1.0, 1.0], 30)
        .with_batch_size(Some(7))
        .with_period(1)
        .init_domain()
        .unwrap();

    let first = (0..3).map(|_| epoch(&mut sampler)).collect::<Vec<_>>();
    sampler.reset();
    let replay = (0..3).map(|_| epoch(&mut sampler)).collect::<Vec<_>>();
    assert_eq!(first, replay);

    let mut twin = SamplerConfig::new(vec![0.0, 0.0], vec![1.0, 1.0], 30)
        .with_batch_size(Some(7))
        .with_period(1)
        .init_domain()
        .unwrap();
    assert_eq!(epoch(&mut twin), first[0]);
}

#[test]
fn point_set_is_replaced_after_each_period() {
    let period = 3;
    let mut sampler = SamplerConfig::new(vec![0.0, 0.0], vec![1.0, 1.0], 32)
        .with_batch_size(Some(8))
        .with_period(period)
        .init_domain()
        .unwrap();

    let epochs = (0..=period).map(|_| epoch(&mut sampler)).collect::<Vec<_>>();
    for repeated in &epochs[1..period] {
        assert_eq!(repeated, &epochs[0]);
    }
    assert_ne!(epochs[period], epochs[0]);
}

#[test]
fn unshuffled_sampler_never_changes_its_points() {
    let mut sampler = SamplerConfig::new(vec![0.0], vec![1.0], 12)
        .with_shuffle(false)
        .init_initial()
        .unwrap();
    let seed = sampler.current_seed();
    let first = sampler.next_batch();
    for _ in 0..10 {
        assert_eq!(sampler.next_batch(), first);
    }
    assert_eq!(sampler.current_seed(), seed);
}

#[test]
fn hundred_points_in_batches_of_ten() {
    let mut sampler = SamplerConfig::new(vec![0.0, 0.0], vec![1.0, 1.0], 100)
        .with_batch_size(Some(10))
        .with_period(1)
        .init_domain()
        .unwrap();
    assert_eq!(sampler.len(), 10);

    let first = epoch(&mut sampler);
    assert!(first.iter().all(|b| b.rows() == 10 && b.dims() == 2));
    let second = epoch(&mut sampler);
    assert_ne!(first, second);
}
