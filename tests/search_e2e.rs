use burn::backend::{Autodiff, NdArray};
use burn::config::Config;

use damped_wave_pinn::artifacts::RunOutput;
use damped_wave_pinn::model::ModelConfig;
use damped_wave_pinn::pinn::WaveProblem;
use damped_wave_pinn::search::{
    BEST_FILENAME, CONVERGENCE_PLOT_FILENAME, Hyperparameters, SEARCH_LOG_FILENAME, SearchConfig,
    search,
};
use damped_wave_pinn::training::TrainingConfig;

type TrainBackend = Autodiff<NdArray<f32>>;

#[test]
fn tiny_search_writes_its_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let output = RunOutput::create(dir.path()).unwrap();
    let base = TrainingConfig::new(ModelConfig::new(), WaveProblem::new())
        .with_num_epochs(1)
        .with_batch_size(16)
        .with_num_domain_points(32)
        .with_num_initial_points(16);
    let search_config = SearchConfig::new()
        .with_n_calls(2)
        .with_n_initial_points(2);

    let (best, result) =
        search::<TrainBackend>(&base, &search_config, &Default::default(), Some(&output)).unwrap();

    assert_eq!(result.observations.len(), 2);
    // 最初の評価は既定値
    assert_eq!(
        result.observations[0].point,
        Hyperparameters::new().to_point()
    );
    assert!(result.observations.iter().all(|o| o.value.is_finite()));

    let log = std::fs::read_to_string(output.file(SEARCH_LOG_FILENAME)).unwrap();
    assert_eq!(log.lines().count(), 2);
    assert!(output.file(CONVERGENCE_PLOT_FILENAME).exists());

    let saved = Hyperparameters::load(output.file(BEST_FILENAME)).unwrap();
    assert_eq!(saved.to_point(), best.to_point());
}
