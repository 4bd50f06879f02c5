use kube::CustomResourceExt;

fn main() {
    let crds = [
        operator::crd::Cluster::crd(),
        operator::crd::Pipeline::crd(),
        operator::crd::Target::crd(),
        operator::crd::TargetProfile::crd(),
        operator::crd::Subscription::crd(),
        operator::crd::Output::crd(),
        operator::crd::Input::crd(),
        operator::crd::Processor::crd(),
        operator::crd::TunnelTargetPolicy::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd).expect("valid crd yaml"));
    }
}
